//! Background sweep rescuing attempts abandoned by crashed coordinators.
//!
//! Every rescue action is a CAS-protected, idempotent step: racing a
//! (hypothetically still alive) original attempt or another process's sweep
//! means at most one write wins and the loser re-reads and re-evaluates.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{debug, info, trace, warn};
use transakto_store::{
    DocStore, Document, StagedOp, StagedPayload, StoreError, WriteOptions,
};

use crate::{
    atr::{decode_attempts, AtrEntry, AtrManager, AtrState, DocRecord},
    config::TransactionsConfig,
    error::TransactionError,
    retry,
    shard::AtrTable,
};

/// Long-lived sweep task owned by the `Transactions` object.
///
/// Walks the whole ATR table once per cleanup window; one in-process task
/// owns the scan cursor. Stopped explicitly via [`Cleaner::stop`], aborted
/// on drop.
pub(crate) struct Cleaner {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn spawn(store: DocStore, config: Arc<TransactionsConfig>, table: Arc<AtrTable>) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let pace =
                (config.cleanup_window / table.len() as u32).max(Duration::from_millis(1));
            let mut interval = interval_at(Instant::now() + pace, pace);
            let mut cursor = 0usize;

            info!(atrs = table.len(), ?pace, "cleanup sweep started");

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        let atr_key = table.get(cursor);
                        cursor = (cursor + 1) % table.len();

                        if let Err(e) = sweep_atr(&store, &config, atr_key, Utc::now()).await {
                            debug!(atr = %atr_key, "sweep failed: {e}");
                        }
                    }
                }
            }

            debug!("cleanup sweep stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        let _ = self.stop.send(true);

        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Rescues every expired entry in one ATR document. Returns how many entries
/// were acted on.
pub(crate) async fn sweep_atr(
    store: &DocStore,
    config: &TransactionsConfig,
    atr_key: &str,
    now: DateTime<Utc>,
) -> Result<usize, TransactionError> {
    let doc = match store.read(atr_key).await {
        Ok(doc) => doc,
        Err(StoreError::NotFound) => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let attempts = decode_attempts(doc.body.as_ref())?;
    let mut rescued = 0;

    for (attempt_id, entry) in attempts {
        if !entry.has_expired(now) {
            continue;
        }

        let atr = AtrManager::new(
            store.clone(),
            write_opts(config),
            atr_key.to_owned(),
            attempt_id.clone(),
            config.atr_cas_retries,
        );

        match rescue_entry(store, config, &atr, &entry).await {
            Ok(()) => rescued += 1,
            Err(e) => warn!(atr = %atr_key, attempt = %attempt_id, "rescue failed: {e}"),
        }
    }

    Ok(rescued)
}

/// Drives one expired entry to its terminal state, derived from the
/// persisted state alone: `Pending` never decided and rolls back,
/// `Committed` already decided and rolls forward, terminal entries are
/// pruned.
pub(crate) async fn rescue_entry(
    store: &DocStore,
    config: &TransactionsConfig,
    atr: &AtrManager,
    entry: &AtrEntry,
) -> Result<(), TransactionError> {
    debug!(
        atr = %atr.atr_key,
        attempt = %atr.attempt_id,
        state = ?entry.state,
        "rescuing expired attempt"
    );

    match entry.state {
        AtrState::Pending => {
            // lock out a still-running commit before touching any document
            match atr.transition(AtrState::Pending, AtrState::Aborted).await {
                Ok(()) => {}
                Err(TransactionError::StateMismatch { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }

            rollback_docs(store, config, &atr.attempt_id, entry).await?;
            advance(atr, AtrState::Aborted, AtrState::RolledBack).await
        }
        AtrState::Aborted => {
            rollback_docs(store, config, &atr.attempt_id, entry).await?;
            advance(atr, AtrState::Aborted, AtrState::RolledBack).await
        }
        AtrState::Committed => {
            roll_forward_docs(store, config, &atr.attempt_id, entry).await?;
            advance(atr, AtrState::Committed, AtrState::Completed).await
        }
        AtrState::Completed | AtrState::RolledBack => atr.prune().await,
    }
}

/// Opportunistic cleanup triggered by a read that met staging left behind by
/// a dead attempt. Best effort; failures only show up in logs and the next
/// sweep gets another chance.
pub(crate) async fn rescue_stale(
    store: &DocStore,
    config: &TransactionsConfig,
    doc: &Document,
    staged: &StagedPayload,
) {
    let atr = AtrManager::new(
        store.clone(),
        write_opts(config),
        staged.atr_key.clone(),
        staged.attempt_id.clone(),
        config.atr_cas_retries,
    );

    let result = match atr.read_entry().await {
        // live after all; the caller's conflict handling applies
        Ok(Some(entry)) if !entry.state.is_terminal() && !entry.has_expired(Utc::now()) => return,
        // finished attempt that missed this document; drop the leftovers
        Ok(Some(entry)) if entry.state.is_terminal() => {
            clear_doc_staging(store, config, doc, staged).await
        }
        Ok(Some(entry)) => rescue_entry(store, config, &atr, &entry).await,
        Ok(None) => clear_doc_staging(store, config, doc, staged).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        debug!(key = %doc.key, "opportunistic cleanup failed: {e}");
    }
}

async fn advance(atr: &AtrManager, from: AtrState, to: AtrState) -> Result<(), TransactionError> {
    match atr.transition(from, to).await {
        Ok(()) => Ok(()),
        // another actor got there first; the next sweep re-evaluates
        Err(TransactionError::StateMismatch { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn rollback_docs(
    store: &DocStore,
    config: &TransactionsConfig,
    attempt_id: &str,
    entry: &AtrEntry,
) -> Result<(), TransactionError> {
    for (shard, records) in &entry.docs {
        trace!(shard, docs = records.len(), "rolling back staged documents");

        for record in records {
            undo_record(store, config, attempt_id, record).await?;
        }
    }

    Ok(())
}

async fn roll_forward_docs(
    store: &DocStore,
    config: &TransactionsConfig,
    attempt_id: &str,
    entry: &AtrEntry,
) -> Result<(), TransactionError> {
    for (shard, records) in &entry.docs {
        trace!(shard, docs = records.len(), "promoting staged documents");

        for record in records {
            promote_record(store, config, attempt_id, record).await?;
        }
    }

    Ok(())
}

async fn undo_record(
    store: &DocStore,
    config: &TransactionsConfig,
    attempt_id: &str,
    record: &DocRecord,
) -> Result<(), TransactionError> {
    let opts = write_opts(config);
    let mut tries = 0;

    loop {
        tries += 1;

        if tries > config.atr_cas_retries {
            return Err(TransactionError::ConcurrentModification);
        }

        let doc = match store.read(&record.key).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound) => return Ok(()),
            Err(StoreError::Unavailable(_)) | Err(StoreError::AmbiguousTimeout) => {
                retry::pause(tries).await;

                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(staged) = &doc.staged else {
            return Ok(());
        };

        if staged.attempt_id != attempt_id {
            return Ok(());
        }

        let result = match staged.op {
            StagedOp::Insert => store.cas_delete(&doc.key, doc.cas, &opts).await,
            StagedOp::Replace | StagedOp::Remove => store
                .clear_staged(&doc.key, doc.cas, &opts)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => return Ok(()),
            // lost a race; re-read and re-evaluate
            Err(StoreError::CasMismatch)
            | Err(StoreError::NotFound)
            | Err(StoreError::Unavailable(_))
            | Err(StoreError::AmbiguousTimeout) => retry::pause(tries).await,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn promote_record(
    store: &DocStore,
    config: &TransactionsConfig,
    attempt_id: &str,
    record: &DocRecord,
) -> Result<(), TransactionError> {
    let opts = write_opts(config);
    let mut tries = 0;

    loop {
        tries += 1;

        if tries > config.atr_cas_retries {
            return Err(TransactionError::ConcurrentModification);
        }

        let doc = match store.read(&record.key).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound) => return Ok(()),
            Err(StoreError::Unavailable(_)) | Err(StoreError::AmbiguousTimeout) => {
                retry::pause(tries).await;

                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(staged) = &doc.staged else {
            // already promoted, here or elsewhere
            return Ok(());
        };

        if staged.attempt_id != attempt_id {
            return Ok(());
        }

        let result = match (staged.op, staged.content.clone()) {
            (StagedOp::Remove, _) => store.cas_delete(&doc.key, doc.cas, &opts).await,
            (_, Some(content)) => store
                .cas_write(&doc.key, content, doc.cas, &opts)
                .await
                .map(|_| ()),
            (op, None) => {
                return Err(TransactionError::ProtocolInvariantViolation(format!(
                    "staged {op:?} without content"
                )))
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(StoreError::CasMismatch)
            | Err(StoreError::NotFound)
            | Err(StoreError::Unavailable(_))
            | Err(StoreError::AmbiguousTimeout) => retry::pause(tries).await,
            Err(e) => return Err(e.into()),
        }
    }
}

fn write_opts(config: &TransactionsConfig) -> WriteOptions {
    WriteOptions::new(config.durability)
}
