//! One retryable attempt at executing a transaction body.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use transakto_store::{
    Cas, DocStore, Document, StagedOp, StagedPayload, StoreError, WriteOptions,
};
use uuid::Uuid;

use crate::{
    atr::{AtrEntry, AtrManager, AtrState, DocRecord},
    cleanup,
    config::TransactionsConfig,
    error::TransactionError,
    query::{QueryExecutor, QueryOptions},
    retry,
    shard::{shard_of, AtrTable},
    staged::{StagedMutation, StagedMutationLog},
    topology::ShardOwner,
};

/// A document as last observed inside an attempt: the value plus the CAS
/// proving the observation. Mutations validate against this CAS, so no newer
/// external write can slip in unnoticed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentView {
    pub key: String,
    pub content: Value,
    pub cas: Cas,
}

/// Operations available to caller logic during one attempt.
///
/// Cheap to clone; all clones share the attempt's staged-mutation log and
/// state.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<Inner>,
}

struct Inner {
    attempt_id: String,
    transaction_id: String,
    config: Arc<TransactionsConfig>,
    store: DocStore,
    table: Arc<AtrTable>,
    topology: Option<Arc<dyn ShardOwner>>,
    query: Option<Arc<dyn QueryExecutor>>,
    write_opts: WriteOptions,
    deadline: Instant,
    state: Mutex<AtrState>,
    log: StagedMutationLog,
    atr: AsyncMutex<Option<Arc<AtrManager>>>,
}

#[allow(clippy::too_many_arguments)]
impl AttemptContext {
    pub(crate) fn new(
        transaction_id: String,
        config: Arc<TransactionsConfig>,
        store: DocStore,
        table: Arc<AtrTable>,
        topology: Option<Arc<dyn ShardOwner>>,
        query: Option<Arc<dyn QueryExecutor>>,
        write_opts: WriteOptions,
        deadline: Instant,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                attempt_id: Uuid::new_v4().simple().to_string(),
                transaction_id,
                config,
                store,
                table,
                topology,
                query,
                write_opts,
                deadline,
                state: Mutex::new(AtrState::Pending),
                log: StagedMutationLog::default(),
                atr: AsyncMutex::new(None),
            }),
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.inner.attempt_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    /// Reads a document's canonical value.
    ///
    /// Content staged by this attempt is returned as-is. Content staged by
    /// another live attempt fails with `WriteWriteConflict`. Content staged
    /// by an expired attempt resolves to the pre-staging value after a
    /// best-effort cleanup of the stale entry.
    pub async fn get(&self, key: &str) -> Result<DocumentView, TransactionError> {
        self.check_expiry("get")?;
        self.trace_route(key);

        let doc = match retry::read_with_retry(&self.inner.store, key, self.remaining()).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound) => return Err(TransactionError::DocumentNotFound),
            Err(e) => return Err(e.into()),
        };

        self.resolve_read(doc).await
    }

    /// Stages a document that must not exist yet. The canonical value stays
    /// invisible to everyone else until commit.
    pub async fn insert(
        &self,
        key: impl Into<String>,
        content: Value,
    ) -> Result<DocumentView, TransactionError> {
        let key = key.into();

        self.check_expiry("insert")?;
        self.trace_route(&key);

        if self.inner.log.get(&key).is_some() {
            return Err(TransactionError::DocumentAlreadyExists);
        }

        let atr = self.ensure_atr(&key).await?;
        let payload = self.payload(StagedOp::Insert, Some(content.clone()), &atr);
        let mut tries = 0;

        loop {
            self.bump_doc(&mut tries, &key)?;

            match self
                .inner
                .store
                .write_staged(&key, payload.clone(), Cas::ZERO, &self.inner.write_opts)
                .await
            {
                Ok(staged_cas) => {
                    self.record(&key, StagedOp::Insert, Some(content.clone()), Cas::ZERO, staged_cas)
                        .await?;

                    return Ok(DocumentView {
                        key,
                        content,
                        cas: staged_cas,
                    });
                }
                Err(StoreError::DocumentExists) => {
                    let doc = match self.inner.store.read(&key).await {
                        Ok(doc) => doc,
                        // the shell vanished between the write and the read
                        Err(StoreError::NotFound) => continue,
                        Err(e) => return Err(e.into()),
                    };

                    match &doc.staged {
                        Some(staged) if staged.attempt_id == self.inner.attempt_id => {
                            return Err(TransactionError::DocumentAlreadyExists);
                        }
                        Some(staged) => {
                            if self.staging_attempt_live(staged).await? {
                                return Err(TransactionError::WriteWriteConflict { key });
                            }

                            cleanup::rescue_stale(
                                &self.inner.store,
                                &self.inner.config,
                                &doc,
                                staged,
                            )
                            .await;

                            retry::pause(tries).await;
                        }
                        None if doc.body.is_some() => {
                            return Err(TransactionError::DocumentAlreadyExists);
                        }
                        None => {
                            // stray shell without staging: claim it
                            if let Ok(staged_cas) = self
                                .inner
                                .store
                                .write_staged(&key, payload.clone(), doc.cas, &self.inner.write_opts)
                                .await
                            {
                                self.record(
                                    &key,
                                    StagedOp::Insert,
                                    Some(content.clone()),
                                    Cas::ZERO,
                                    staged_cas,
                                )
                                .await?;

                                return Ok(DocumentView {
                                    key,
                                    content,
                                    cas: staged_cas,
                                });
                            }
                        }
                    }
                }
                Err(StoreError::AmbiguousTimeout) | Err(StoreError::Unavailable(_)) => {
                    // outcome unknown: re-read and claim success if our
                    // staging landed
                    if let Ok(doc) = self.inner.store.read(&key).await {
                        if let Some(staged) = &doc.staged {
                            if staged.attempt_id == self.inner.attempt_id {
                                self.record(
                                    &key,
                                    StagedOp::Insert,
                                    Some(content.clone()),
                                    Cas::ZERO,
                                    doc.cas,
                                )
                                .await?;

                                return Ok(DocumentView {
                                    key,
                                    content,
                                    cas: doc.cas,
                                });
                            }
                        }
                    }

                    retry::pause(tries).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stages a new value for a document observed via [`AttemptContext::get`].
    pub async fn replace(
        &self,
        doc: &DocumentView,
        content: Value,
    ) -> Result<DocumentView, TransactionError> {
        self.check_expiry("replace")?;
        self.trace_route(&doc.key);

        let atr = self.ensure_atr(&doc.key).await?;

        // replacing an own staged insert keeps insert semantics
        let op = match self.inner.log.get(&doc.key) {
            Some(m) if m.op == StagedOp::Insert => StagedOp::Insert,
            _ => StagedOp::Replace,
        };

        self.stage_write(&doc.key, op, Some(content), doc.cas, &atr)
            .await
    }

    /// Stages the removal of a document observed via [`AttemptContext::get`].
    pub async fn remove(&self, doc: DocumentView) -> Result<(), TransactionError> {
        self.check_expiry("remove")?;
        self.trace_route(&doc.key);

        let atr = self.ensure_atr(&doc.key).await?;

        self.stage_write(&doc.key, StagedOp::Remove, None, doc.cas, &atr)
            .await?;

        Ok(())
    }

    /// Runs a statement through the configured query collaborator. The
    /// per-transaction scan-consistency default applies only when the
    /// per-call option is unset.
    pub async fn query(
        &self,
        statement: &str,
        options: QueryOptions,
    ) -> Result<Vec<Value>, TransactionError> {
        self.check_expiry("query")?;

        let Some(executor) = &self.inner.query else {
            return Err(TransactionError::Query(anyhow::anyhow!(
                "no query executor configured"
            )));
        };

        let mut options = options;

        if options.scan_consistency.is_none() {
            options.scan_consistency = self.inner.config.query.scan_consistency;
        }

        executor
            .query(statement, options)
            .await
            .map_err(TransactionError::Query)
    }

    /// Commits the attempt: `Pending → Committed` is the atomicity boundary,
    /// then every staged change is promoted in staging order, then the entry
    /// moves to `Completed`. Dying between `Committed` and `Completed` leaves
    /// the cleanup sweep to finish the unstaging.
    pub(crate) async fn commit(&self) -> Result<(), TransactionError> {
        {
            let state = self.inner.state.lock();

            if *state != AtrState::Pending {
                return Err(TransactionError::ProtocolInvariantViolation(format!(
                    "commit from {:?}",
                    *state
                )));
            }
        }

        let mutations = self.inner.log.all();

        if mutations.is_empty() {
            *self.inner.state.lock() = AtrState::Completed;
            debug!(attempt = %self.inner.attempt_id, "nothing staged, commit is trivial");

            return Ok(());
        }

        self.check_expiry("commit")?;

        let atr = self.atr().await.ok_or_else(|| {
            TransactionError::ProtocolInvariantViolation(
                "staged mutations without an atr entry".to_owned(),
            )
        })?;

        // the commit point: once this lands, the transaction takes effect
        // everywhere even if this process dies now
        atr.transition(AtrState::Pending, AtrState::Committed).await?;
        *self.inner.state.lock() = AtrState::Committed;

        debug!(
            attempt = %self.inner.attempt_id,
            transaction = %self.inner.transaction_id,
            docs = mutations.len(),
            "committed"
        );

        for mutation in &mutations {
            self.unstage(mutation).await?;
        }

        // completion is advisory: the decision is already durable and the
        // sweep converges this entry if the transition is lost
        if let Err(e) = atr.transition(AtrState::Committed, AtrState::Completed).await {
            warn!(attempt = %self.inner.attempt_id, "failed to mark attempt completed: {e}");
        }

        *self.inner.state.lock() = AtrState::Completed;

        Ok(())
    }

    /// Rolls the attempt back: `Pending → Aborted`, staged changes undone in
    /// reverse staging order, then `Aborted → RolledBack`. Individual undo
    /// failures are left to the cleanup sweep.
    pub(crate) async fn rollback(&self) -> Result<(), TransactionError> {
        {
            let state = self.inner.state.lock();

            if *state != AtrState::Pending {
                return Err(TransactionError::ProtocolInvariantViolation(format!(
                    "rollback from {:?}",
                    *state
                )));
            }
        }

        let Some(atr) = self.atr().await else {
            // nothing was ever persisted
            *self.inner.state.lock() = AtrState::RolledBack;

            return Ok(());
        };

        match atr.transition(AtrState::Pending, AtrState::Aborted).await {
            Ok(()) => {}
            // the sweep got here first; its rollback covers ours
            Err(TransactionError::StateMismatch {
                found: Some(AtrState::Aborted | AtrState::RolledBack),
                ..
            })
            | Err(TransactionError::StateMismatch { found: None, .. }) => {
                *self.inner.state.lock() = AtrState::RolledBack;

                return Ok(());
            }
            // an ambiguously-lost commit write landed after all; the
            // decision stands and must never be rolled back
            Err(
                e @ TransactionError::StateMismatch {
                    found: Some(AtrState::Committed | AtrState::Completed),
                    ..
                },
            ) => {
                *self.inner.state.lock() = AtrState::Committed;

                return Err(e);
            }
            Err(e) => return Err(e),
        }

        *self.inner.state.lock() = AtrState::Aborted;

        for mutation in self.inner.log.all().iter().rev() {
            if let Err(e) = self.undo(mutation).await {
                warn!(
                    attempt = %self.inner.attempt_id,
                    key = %mutation.key,
                    "rollback of staged change failed, the sweep finishes it: {e}"
                );
            }
        }

        if let Err(e) = atr.transition(AtrState::Aborted, AtrState::RolledBack).await {
            warn!(attempt = %self.inner.attempt_id, "failed to mark attempt rolled back: {e}");
        }

        *self.inner.state.lock() = AtrState::RolledBack;

        Ok(())
    }

    pub(crate) fn state(&self) -> AtrState {
        *self.inner.state.lock()
    }

    pub(crate) fn staged_keys(&self) -> Vec<String> {
        self.inner.log.all().into_iter().map(|m| m.key).collect()
    }

    async fn resolve_read(&self, doc: Document) -> Result<DocumentView, TransactionError> {
        let Some(staged) = doc.staged.clone() else {
            return match doc.body {
                Some(content) => Ok(DocumentView {
                    key: doc.key,
                    content,
                    cas: doc.cas,
                }),
                None => Err(TransactionError::DocumentNotFound),
            };
        };

        if staged.attempt_id == self.inner.attempt_id {
            // read-your-own-writes
            return match (staged.op, staged.content) {
                (StagedOp::Remove, _) => Err(TransactionError::DocumentNotFound),
                (_, Some(content)) => Ok(DocumentView {
                    key: doc.key,
                    content,
                    cas: doc.cas,
                }),
                (op, None) => Err(TransactionError::ProtocolInvariantViolation(format!(
                    "staged {op:?} without content"
                ))),
            };
        }

        if self.staging_attempt_live(&staged).await? {
            return Err(TransactionError::WriteWriteConflict { key: doc.key });
        }

        // the staging attempt is dead: resolve to the pre-staging value and
        // opportunistically clean the stale entry
        cleanup::rescue_stale(&self.inner.store, &self.inner.config, &doc, &staged).await;

        match doc.body {
            Some(content) => Ok(DocumentView {
                key: doc.key,
                content,
                cas: doc.cas,
            }),
            None => Err(TransactionError::DocumentNotFound),
        }
    }

    async fn staging_attempt_live(&self, staged: &StagedPayload) -> Result<bool, TransactionError> {
        let atr = AtrManager::new(
            self.inner.store.clone(),
            self.inner.write_opts,
            staged.atr_key.clone(),
            staged.attempt_id.clone(),
            self.inner.config.atr_cas_retries,
        );

        match atr.read_entry().await? {
            Some(entry) => Ok(!entry.state.is_terminal() && !entry.has_expired(Utc::now())),
            None => Ok(false),
        }
    }

    async fn stage_write(
        &self,
        key: &str,
        op: StagedOp,
        content: Option<Value>,
        observed: Cas,
        atr: &Arc<AtrManager>,
    ) -> Result<DocumentView, TransactionError> {
        let payload = self.payload(op, content.clone(), atr);

        // re-staging validates against our own staging CAS, first staging
        // against the value last observed via get
        let (mut expected, pre_cas) = match self.inner.log.get(key) {
            Some(m) => (m.staged_cas, m.pre_cas),
            None => (observed, observed),
        };

        let mut tries = 0;

        loop {
            self.bump_doc(&mut tries, key)?;

            match self
                .inner
                .store
                .write_staged(key, payload.clone(), expected, &self.inner.write_opts)
                .await
            {
                Ok(staged_cas) => {
                    self.record(key, op, content.clone(), pre_cas, staged_cas).await?;

                    return Ok(DocumentView {
                        key: key.to_owned(),
                        content: content.unwrap_or(Value::Null),
                        cas: staged_cas,
                    });
                }
                Err(StoreError::CasMismatch) => {
                    let doc = match self.inner.store.read(key).await {
                        Ok(doc) => doc,
                        Err(StoreError::NotFound) => return Err(TransactionError::DocumentNotFound),
                        Err(e) => return Err(e.into()),
                    };

                    match &doc.staged {
                        Some(staged) if staged.attempt_id == self.inner.attempt_id => {
                            // an earlier ambiguous write of ours moved the CAS
                            expected = doc.cas;
                        }
                        Some(staged) => {
                            if self.staging_attempt_live(staged).await? {
                                return Err(TransactionError::WriteWriteConflict {
                                    key: key.to_owned(),
                                });
                            }

                            cleanup::rescue_stale(
                                &self.inner.store,
                                &self.inner.config,
                                &doc,
                                staged,
                            )
                            .await;

                            // the observed value predates the cleanup
                            return Err(TransactionError::Conflict { key: key.to_owned() });
                        }
                        None => {
                            // an external writer got in after our get
                            return Err(TransactionError::Conflict { key: key.to_owned() });
                        }
                    }
                }
                Err(StoreError::NotFound) => return Err(TransactionError::DocumentNotFound),
                Err(StoreError::AmbiguousTimeout) | Err(StoreError::Unavailable(_)) => {
                    if let Ok(doc) = self.inner.store.read(key).await {
                        match &doc.staged {
                            Some(staged)
                                if staged.attempt_id == self.inner.attempt_id
                                    && staged.op == op
                                    && staged.content == content =>
                            {
                                // the write landed after all
                                self.record(key, op, content.clone(), pre_cas, doc.cas).await?;

                                return Ok(DocumentView {
                                    key: key.to_owned(),
                                    content: content.unwrap_or(Value::Null),
                                    cas: doc.cas,
                                });
                            }
                            Some(staged) if staged.attempt_id == self.inner.attempt_id => {
                                expected = doc.cas;
                            }
                            _ => {}
                        }
                    }

                    retry::pause(tries).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn unstage(&self, mutation: &StagedMutation) -> Result<(), TransactionError> {
        self.trace_route(&mutation.key);

        let mut cas = mutation.staged_cas;
        let mut tries = 0;

        loop {
            // post-commit, expiry is fatal to this attempt but never to the
            // transaction: the sweep honors the decision
            if self.remaining().is_zero() {
                return Err(TransactionError::Expired);
            }

            tries += 1;

            if tries > self.inner.config.atr_cas_retries {
                return Err(TransactionError::ConcurrentModification);
            }

            let result = match mutation.op {
                StagedOp::Insert | StagedOp::Replace => {
                    let Some(content) = mutation.content.clone() else {
                        return Err(TransactionError::ProtocolInvariantViolation(format!(
                            "staged {:?} without content",
                            mutation.op
                        )));
                    };

                    self.inner
                        .store
                        .cas_write(&mutation.key, content, cas, &self.inner.write_opts)
                        .await
                        .map(|_| ())
                }
                StagedOp::Remove => {
                    self.inner
                        .store
                        .cas_delete(&mutation.key, cas, &self.inner.write_opts)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    trace!(key = %mutation.key, "unstaged");

                    return Ok(());
                }
                Err(StoreError::CasMismatch) => {
                    let doc = match self.inner.store.read(&mutation.key).await {
                        Ok(doc) => doc,
                        Err(StoreError::NotFound) => return Ok(()),
                        Err(_) => {
                            retry::pause(tries).await;

                            continue;
                        }
                    };

                    match &doc.staged {
                        Some(staged) if staged.attempt_id == self.inner.attempt_id => {
                            cas = doc.cas;
                        }
                        _ => {
                            // the sweep (or a raced actor) already promoted it
                            trace!(key = %mutation.key, "already unstaged elsewhere");

                            return Ok(());
                        }
                    }
                }
                Err(StoreError::NotFound) => return Ok(()),
                Err(StoreError::AmbiguousTimeout) | Err(StoreError::Unavailable(_)) => {
                    retry::pause(tries).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn undo(&self, mutation: &StagedMutation) -> Result<(), TransactionError> {
        self.trace_route(&mutation.key);

        let mut cas = mutation.staged_cas;
        let mut tries = 0;

        loop {
            tries += 1;

            if tries > self.inner.config.atr_cas_retries {
                return Err(TransactionError::ConcurrentModification);
            }

            let result = match mutation.op {
                // rolling back an insert deletes the shell; everything else
                // just drops the staging area
                StagedOp::Insert => {
                    self.inner
                        .store
                        .cas_delete(&mutation.key, cas, &self.inner.write_opts)
                        .await
                }
                StagedOp::Replace | StagedOp::Remove => self
                    .inner
                    .store
                    .clear_staged(&mutation.key, cas, &self.inner.write_opts)
                    .await
                    .map(|_| ()),
            };

            match result {
                Ok(()) => {
                    trace!(key = %mutation.key, "rolled back");

                    return Ok(());
                }
                Err(StoreError::CasMismatch) => {
                    let doc = match self.inner.store.read(&mutation.key).await {
                        Ok(doc) => doc,
                        Err(StoreError::NotFound) => return Ok(()),
                        Err(_) => {
                            retry::pause(tries).await;

                            continue;
                        }
                    };

                    match &doc.staged {
                        Some(staged) if staged.attempt_id == self.inner.attempt_id => {
                            cas = doc.cas;
                        }
                        _ => return Ok(()),
                    }
                }
                Err(StoreError::NotFound) => return Ok(()),
                Err(StoreError::AmbiguousTimeout) | Err(StoreError::Unavailable(_)) => {
                    retry::pause(tries).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Appends the mutation to the log and rewrites the ATR entry's
    /// staged-document lists from the log's per-shard grouping.
    async fn record(
        &self,
        key: &str,
        op: StagedOp,
        content: Option<Value>,
        pre_cas: Cas,
        staged_cas: Cas,
    ) -> Result<(), TransactionError> {
        let shard = shard_of(key, self.inner.config.num_shards);

        self.inner.log.stage(StagedMutation {
            key: key.to_owned(),
            shard,
            op,
            content,
            pre_cas,
            staged_cas,
        });

        let atr = self.atr().await.ok_or_else(|| {
            TransactionError::ProtocolInvariantViolation(
                "staged mutation without an atr entry".to_owned(),
            )
        })?;

        let docs: BTreeMap<u16, Vec<DocRecord>> = self
            .inner
            .log
            .for_each_shard()
            .into_iter()
            .map(|(shard, mutations)| {
                (
                    shard,
                    mutations
                        .into_iter()
                        .map(|m| DocRecord {
                            key: m.key,
                            op: m.op,
                        })
                        .collect(),
                )
            })
            .collect();

        atr.write_records(docs).await
    }

    async fn ensure_atr(&self, key: &str) -> Result<Arc<AtrManager>, TransactionError> {
        let mut slot = self.inner.atr.lock().await;

        if let Some(atr) = slot.as_ref() {
            return Ok(atr.clone());
        }

        let (atr_key, shard) = self.inner.table.atr_for(key);
        let atr = Arc::new(AtrManager::new(
            self.inner.store.clone(),
            self.inner.write_opts,
            atr_key.to_owned(),
            self.inner.attempt_id.clone(),
            self.inner.config.atr_cas_retries,
        ));

        atr.create_pending(AtrEntry {
            transaction_id: self.inner.transaction_id.clone(),
            state: AtrState::Pending,
            started_at: Utc::now(),
            expires_after_ms: self.remaining().as_millis() as u64,
            docs: BTreeMap::new(),
        })
        .await?;

        debug!(
            attempt = %self.inner.attempt_id,
            atr = %atr.atr_key,
            shard,
            "selected atr from first mutated key"
        );

        *slot = Some(atr.clone());

        Ok(atr)
    }

    pub(crate) async fn atr(&self) -> Option<Arc<AtrManager>> {
        self.inner.atr.lock().await.clone()
    }

    fn payload(&self, op: StagedOp, content: Option<Value>, atr: &AtrManager) -> StagedPayload {
        StagedPayload {
            transaction_id: self.inner.transaction_id.clone(),
            attempt_id: self.inner.attempt_id.clone(),
            op,
            content,
            atr_key: atr.atr_key.clone(),
            staged_at: Utc::now(),
        }
    }

    fn trace_route(&self, key: &str) {
        if let Some(topology) = &self.inner.topology {
            let shard = shard_of(key, self.inner.config.num_shards);

            if let Some(node) = topology.shard_owner(shard) {
                trace!(key, shard, node = %node, "routing to shard owner");
            }
        }
    }

    fn check_expiry(&self, stage: &str) -> Result<(), TransactionError> {
        if Instant::now() >= self.inner.deadline {
            debug!(attempt = %self.inner.attempt_id, stage, "deadline passed");

            return Err(TransactionError::Expired);
        }

        Ok(())
    }

    fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    fn bump_doc(&self, tries: &mut u32, key: &str) -> Result<(), TransactionError> {
        *tries += 1;

        if *tries > self.inner.config.atr_cas_retries {
            return Err(TransactionError::Conflict {
                key: key.to_owned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use transakto_store::Memory;

    fn context(store: &DocStore, transaction_id: &str) -> AttemptContext {
        let config = Arc::new(TransactionsConfig {
            num_shards: 4,
            cleanup_lost: false,
            ..TransactionsConfig::default()
        });
        let table = Arc::new(AtrTable::new(config.num_shards, config.atr_blocks));

        AttemptContext::new(
            transaction_id.to_owned(),
            config,
            store.clone(),
            table,
            None,
            None,
            WriteOptions::default(),
            Instant::now() + Duration::from_secs(15),
        )
    }

    async fn seed(store: &DocStore, key: &str, content: Value) -> Cas {
        store
            .cas_write(key, content, Cas::ZERO, &WriteOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn staged_insert_is_invisible_and_conflicts() {
        let store = Memory::store();
        let a = context(&store, "tx-a");
        let b = context(&store, "tx-b");

        a.insert("cust-9", json!({"vip": true})).await.unwrap();

        // canonical read must not see the staged insert
        let err = b.get("cust-9").await.unwrap_err();
        assert!(matches!(err, TransactionError::DocumentNotFound));

        // a competing insert must observe the conflict
        let err = b.insert("cust-9", json!({"vip": false})).await.unwrap_err();
        assert!(matches!(err, TransactionError::WriteWriteConflict { .. }));
    }

    #[tokio::test]
    async fn racing_stagers_exactly_one_wins() {
        let store = Memory::store();
        seed(&store, "order-1", json!({"total": 10})).await;

        let a = context(&store, "tx-a");
        let b = context(&store, "tx-b");

        let doc_a = a.get("order-1").await.unwrap();
        let doc_b = b.get("order-1").await.unwrap();

        a.replace(&doc_a, json!({"total": 20})).await.unwrap();

        let err = b.replace(&doc_b, json!({"total": 30})).await.unwrap_err();
        assert!(matches!(err, TransactionError::WriteWriteConflict { .. }));

        // the loser also conflicts on reads now
        let err = b.get("order-1").await.unwrap_err();
        assert!(matches!(err, TransactionError::WriteWriteConflict { .. }));
    }

    #[tokio::test]
    async fn read_your_own_writes() {
        let store = Memory::store();
        seed(&store, "order-1", json!({"total": 10})).await;

        let ctx = context(&store, "tx-a");

        let doc = ctx.get("order-1").await.unwrap();
        assert_eq!(doc.content, json!({"total": 10}));

        let doc = ctx.replace(&doc, json!({"total": 20})).await.unwrap();
        assert_eq!(
            ctx.get("order-1").await.unwrap().content,
            json!({"total": 20})
        );

        // everyone else still sees the canonical value
        let other = context(&store, "tx-b");
        let err = other.get("order-1").await.unwrap_err();
        assert!(matches!(err, TransactionError::WriteWriteConflict { .. }));

        ctx.remove(doc).await.unwrap();

        let err = ctx.get("order-1").await.unwrap_err();
        assert!(matches!(err, TransactionError::DocumentNotFound));
    }

    #[tokio::test]
    async fn commit_promotes_staged_changes() {
        let store = Memory::store();
        seed(&store, "order-1", json!({"total": 10})).await;
        seed(&store, "order-2", json!({"total": 5})).await;

        let ctx = context(&store, "tx-a");

        ctx.insert("cust-9", json!({"vip": true})).await.unwrap();

        let doc = ctx.get("order-1").await.unwrap();
        ctx.replace(&doc, json!({"total": 20})).await.unwrap();

        let doc = ctx.get("order-2").await.unwrap();
        ctx.remove(doc).await.unwrap();

        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AtrState::Completed);

        let doc = store.read("cust-9").await.unwrap();
        assert_eq!(doc.body, Some(json!({"vip": true})));
        assert!(doc.staged.is_none());

        let doc = store.read("order-1").await.unwrap();
        assert_eq!(doc.body, Some(json!({"total": 20})));
        assert!(doc.staged.is_none());

        assert!(matches!(
            store.read("order-2").await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn rollback_restores_pre_attempt_state() {
        let store = Memory::store();
        seed(&store, "order-1", json!({"total": 10})).await;

        let ctx = context(&store, "tx-a");

        let doc = ctx.get("order-1").await.unwrap();
        ctx.replace(&doc, json!({"total": 20})).await.unwrap();
        ctx.insert("cust-9", json!({"vip": true})).await.unwrap();

        ctx.rollback().await.unwrap();
        assert_eq!(ctx.state(), AtrState::RolledBack);

        let doc = store.read("order-1").await.unwrap();
        assert_eq!(doc.body, Some(json!({"total": 10})));
        assert!(doc.staged.is_none());

        assert!(matches!(
            store.read("cust-9").await.unwrap_err(),
            StoreError::NotFound
        ));

        // a fresh attempt proceeds as if the first never ran
        let fresh = context(&store, "tx-b");
        let doc = fresh.get("order-1").await.unwrap();
        assert_eq!(doc.content, json!({"total": 10}));

        fresh.replace(&doc, json!({"total": 30})).await.unwrap();
        fresh.insert("cust-9", json!({"vip": false})).await.unwrap();
        fresh.commit().await.unwrap();

        assert_eq!(
            store.read("order-1").await.unwrap().body,
            Some(json!({"total": 30}))
        );
        assert_eq!(
            store.read("cust-9").await.unwrap().body,
            Some(json!({"vip": false}))
        );
    }

    #[tokio::test]
    async fn commit_twice_is_a_programming_error() {
        let store = Memory::store();
        let ctx = context(&store, "tx-a");

        ctx.insert("cust-9", json!({})).await.unwrap();
        ctx.commit().await.unwrap();

        let err = ctx.commit().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ProtocolInvariantViolation(_)
        ));
    }

    #[tokio::test]
    async fn rollback_after_commit_is_a_programming_error() {
        let store = Memory::store();
        let ctx = context(&store, "tx-a");

        ctx.insert("cust-9", json!({})).await.unwrap();
        ctx.commit().await.unwrap();

        let err = ctx.rollback().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ProtocolInvariantViolation(_)
        ));
    }

    #[tokio::test]
    async fn empty_commit_is_trivial() {
        let store = Memory::store();
        let ctx = context(&store, "tx-a");

        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AtrState::Completed);
    }

    #[tokio::test]
    async fn expired_attempt_rejects_operations() {
        let store = Memory::store();
        let config = Arc::new(TransactionsConfig {
            num_shards: 4,
            cleanup_lost: false,
            ..TransactionsConfig::default()
        });
        let table = Arc::new(AtrTable::new(config.num_shards, config.atr_blocks));

        let ctx = AttemptContext::new(
            "tx-a".to_owned(),
            config,
            store.clone(),
            table,
            None,
            None,
            WriteOptions::default(),
            Instant::now() - Duration::from_millis(1),
        );

        let err = ctx.get("order-1").await.unwrap_err();
        assert!(matches!(err, TransactionError::Expired));

        let err = ctx.insert("order-1", json!({})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Expired));
    }

    #[tokio::test]
    async fn get_resolves_staging_of_vanished_attempt() {
        let store = Memory::store();
        let cas = seed(&store, "order-1", json!({"total": 10})).await;

        // staging left behind by an attempt whose ATR entry no longer exists
        store
            .write_staged(
                "order-1",
                StagedPayload {
                    transaction_id: "tx-ghost".to_owned(),
                    attempt_id: "attempt-ghost".to_owned(),
                    op: StagedOp::Replace,
                    content: Some(json!({"total": 99})),
                    atr_key: "_txn:atr-0-#0".to_owned(),
                    staged_at: Utc::now(),
                },
                cas,
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let ctx = context(&store, "tx-a");

        let doc = ctx.get("order-1").await.unwrap();
        assert_eq!(doc.content, json!({"total": 10}));

        // the stale staging was opportunistically cleaned
        let doc = store.read("order-1").await.unwrap();
        assert!(doc.staged.is_none());
        assert_eq!(doc.body, Some(json!({"total": 10})));
    }

    #[tokio::test]
    async fn insert_over_vanished_attempt_shell_succeeds() {
        let store = Memory::store();

        store
            .write_staged(
                "cust-9",
                StagedPayload {
                    transaction_id: "tx-ghost".to_owned(),
                    attempt_id: "attempt-ghost".to_owned(),
                    op: StagedOp::Insert,
                    content: Some(json!({"vip": true})),
                    atr_key: "_txn:atr-0-#0".to_owned(),
                    staged_at: Utc::now(),
                },
                Cas::ZERO,
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let ctx = context(&store, "tx-a");

        ctx.insert("cust-9", json!({"vip": false})).await.unwrap();
        ctx.commit().await.unwrap();

        assert_eq!(
            store.read("cust-9").await.unwrap().body,
            Some(json!({"vip": false}))
        );
    }

    #[tokio::test]
    async fn replace_over_external_write_is_a_conflict() {
        let store = Memory::store();
        seed(&store, "order-1", json!({"total": 10})).await;

        let ctx = context(&store, "tx-a");
        let doc = ctx.get("order-1").await.unwrap();

        // an external writer slips in after our get
        store
            .cas_write("order-1", json!({"total": 11}), doc.cas, &WriteOptions::default())
            .await
            .unwrap();

        let err = ctx.replace(&doc, json!({"total": 20})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Conflict { .. }));
    }
}
