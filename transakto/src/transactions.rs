//! Top-level entry point: runs caller logic inside successive attempts.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use backoff::backoff::Backoff;
use tracing::{debug, warn};
use transakto_store::{DocStore, Durability, WriteOptions};
use uuid::Uuid;

use crate::{
    atr::AtrState,
    attempt::AttemptContext,
    cleanup::Cleaner,
    config::TransactionsConfig,
    error::{ErrorClass, FailureOutcome, TransactionError, TransactionFailed},
    query::QueryExecutor,
    retry,
    shard::AtrTable,
    topology::ShardOwner,
};

/// External-abort signal, deliverable between attempts.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-transaction overrides of the coordinator-wide configuration.
#[derive(Clone, Default)]
pub struct TransactionOptions {
    pub expiration: Option<Duration>,
    pub durability: Option<Durability>,
    pub abort: Option<AbortHandle>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiration(mut self, v: Duration) -> Self {
        self.expiration = Some(v);

        self
    }

    pub fn durability(mut self, v: Durability) -> Self {
        self.durability = Some(v);

        self
    }

    pub fn abort_handle(mut self, v: AbortHandle) -> Self {
        self.abort = Some(v);

        self
    }
}

/// One attempt's contribution to the diagnostic trail.
#[derive(Debug, Clone)]
pub struct AttemptSummary {
    pub attempt_id: String,
    pub state: AtrState,
    pub error: Option<String>,
}

/// Final outcome reported to the caller.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub attempts: Vec<AttemptSummary>,
    /// Keys mutated by the deciding attempt, in staging order.
    pub mutated: Vec<String>,
    /// Whether every staged document already holds its final value; when
    /// false after a committed outcome, the cleanup sweep finishes the rest.
    pub unstaging_complete: bool,
}

/// Client-side transaction coordinator.
///
/// Creating one launches the owned cleanup sweep (unless disabled); dropping
/// it aborts the sweep, [`Transactions::close`] stops it gracefully. Many
/// coordinators may run concurrently against the same store with no central
/// lock manager.
pub struct Transactions {
    store: DocStore,
    config: Arc<TransactionsConfig>,
    table: Arc<AtrTable>,
    topology: Option<Arc<dyn ShardOwner>>,
    query: Option<Arc<dyn QueryExecutor>>,
    cleaner: Option<Cleaner>,
}

impl Transactions {
    pub fn new(store: DocStore, config: TransactionsConfig) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(AtrTable::new(config.num_shards, config.atr_blocks));

        let cleaner = config
            .cleanup_lost
            .then(|| Cleaner::spawn(store.clone(), config.clone(), table.clone()));

        Self {
            store,
            config,
            table,
            topology: None,
            query: None,
            cleaner,
        }
    }

    pub fn query_executor<Q: QueryExecutor + 'static>(mut self, executor: Q) -> Self {
        self.query = Some(Arc::new(executor));

        self
    }

    pub fn topology<T: ShardOwner + 'static>(mut self, topology: T) -> Self {
        self.topology = Some(Arc::new(topology));

        self
    }

    /// Runs `logic` inside successive attempts until commit or permanent
    /// failure. Returning `Ok` from `logic` commits the attempt; returning
    /// any error rolls it back, and retryable protocol errors start a fresh
    /// attempt after a backoff.
    pub async fn run<F, Fut>(&self, logic: F) -> Result<TransactionResult, TransactionFailed>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_with(TransactionOptions::default(), logic).await
    }

    pub async fn run_with<F, Fut>(
        &self,
        options: TransactionOptions,
        logic: F,
    ) -> Result<TransactionResult, TransactionFailed>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let transaction_id = Uuid::new_v4().simple().to_string();
        let expiration = options.expiration.unwrap_or(self.config.expiration);
        let write_opts = WriteOptions::new(options.durability.unwrap_or(self.config.durability));
        let deadline = Instant::now() + expiration;
        let mut attempts: Vec<AttemptSummary> = Vec::new();
        let mut backoff = retry::backoff_until(expiration);

        debug!(transaction = %transaction_id, ?expiration, "transaction started");

        loop {
            if options.abort.as_ref().is_some_and(AbortHandle::is_aborted) {
                return Err(Self::fail(
                    transaction_id,
                    attempts,
                    TransactionError::AbortedExternally,
                    FailureOutcome::RolledBack,
                ));
            }

            if Instant::now() >= deadline {
                return Err(Self::fail(
                    transaction_id,
                    attempts,
                    TransactionError::Expired,
                    FailureOutcome::RolledBack,
                ));
            }

            let ctx = AttemptContext::new(
                transaction_id.clone(),
                self.config.clone(),
                self.store.clone(),
                self.table.clone(),
                self.topology.clone(),
                self.query.clone(),
                write_opts,
                deadline,
            );
            let attempt_id = ctx.attempt_id().to_owned();

            debug!(
                transaction = %transaction_id,
                attempt = %attempt_id,
                n = attempts.len() + 1,
                "attempt started"
            );

            let result = match logic(ctx.clone()).await {
                Ok(()) => ctx.commit().await,
                Err(e) => Err(match e.downcast::<TransactionError>() {
                    Ok(protocol) => protocol,
                    Err(other) => TransactionError::Logic(other),
                }),
            };

            let error = match result {
                Ok(()) => {
                    attempts.push(AttemptSummary {
                        attempt_id,
                        state: ctx.state(),
                        error: None,
                    });

                    debug!(transaction = %transaction_id, "transaction committed");

                    return Ok(TransactionResult {
                        transaction_id,
                        attempts,
                        mutated: ctx.staged_keys(),
                        unstaging_complete: true,
                    });
                }
                Err(error) => error,
            };

            let mut class = error.classify();

            // operation-level retries are absorbed at the call sites; one
            // surfacing here costs the whole attempt
            if class == ErrorClass::RetryOperation {
                class = ErrorClass::RetryTransaction;
            }

            self.try_rollback(&ctx).await;

            attempts.push(AttemptSummary {
                attempt_id,
                state: ctx.state(),
                error: Some(error.to_string()),
            });

            // once the commit decision landed it is never revisited, no
            // matter how the attempt failed afterwards; the cleanup sweep
            // finishes whatever this attempt could not
            if ctx.state() == AtrState::Committed {
                warn!(
                    transaction = %transaction_id,
                    "commit decided but unstaging incomplete: {error}"
                );

                return Err(TransactionFailed {
                    error,
                    outcome: FailureOutcome::Committed,
                    result: TransactionResult {
                        transaction_id,
                        attempts,
                        mutated: ctx.staged_keys(),
                        unstaging_complete: false,
                    },
                });
            }

            // a retryable failure past the deadline is fatal
            if class == ErrorClass::RetryTransaction && Instant::now() < deadline {
                match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(
                            transaction = %transaction_id,
                            ?delay,
                            "attempt failed, retrying: {error}"
                        );

                        tokio::time::sleep(delay).await;

                        continue;
                    }
                    None => {
                        return Err(Self::fail(
                            transaction_id,
                            attempts,
                            TransactionError::Expired,
                            FailureOutcome::RolledBack,
                        ));
                    }
                }
            }

            let outcome = match ctx.state() {
                AtrState::Pending | AtrState::Aborted | AtrState::RolledBack => {
                    FailureOutcome::RolledBack
                }
                _ => FailureOutcome::Unknown,
            };

            warn!(transaction = %transaction_id, "transaction failed: {error}");

            return Err(TransactionFailed {
                error,
                outcome,
                result: TransactionResult {
                    transaction_id,
                    attempts,
                    mutated: Vec::new(),
                    unstaging_complete: false,
                },
            });
        }
    }

    /// Stops the owned cleanup sweep gracefully.
    pub async fn close(mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.stop().await;
        }
    }

    async fn try_rollback(&self, ctx: &AttemptContext) {
        if ctx.state() == AtrState::Pending {
            if let Err(e) = ctx.rollback().await {
                warn!(
                    attempt = %ctx.attempt_id(),
                    "rollback failed, the sweep finishes it: {e}"
                );
            }
        }
    }

    fn fail(
        transaction_id: String,
        attempts: Vec<AttemptSummary>,
        error: TransactionError,
        outcome: FailureOutcome,
    ) -> TransactionFailed {
        warn!(transaction = %transaction_id, "transaction failed: {error}");

        TransactionFailed {
            error,
            outcome,
            result: TransactionResult {
                transaction_id,
                attempts,
                mutated: Vec::new(),
                unstaging_complete: false,
            },
        }
    }
}
