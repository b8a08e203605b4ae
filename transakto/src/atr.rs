//! Active transaction record entries and their state machine.
//!
//! One ATR document per shard, holding a mapping of attempt id to entry.
//! The document is created lazily on first use of its shard and never
//! deleted; only entries within it are pruned. Every mutation here is a
//! CAS-protected read-modify-write of the whole document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;
use transakto_store::{Cas, DocStore, StagedOp, StoreError, WriteOptions};

use crate::{error::TransactionError, retry};

/// Attempt states, in transition order.
///
/// `Pending → Committed → Completed` on the commit path,
/// `Pending → Aborted → RolledBack` on the rollback path. Transitions are
/// monotonic; an entry never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtrState {
    Pending,
    Committed,
    Completed,
    Aborted,
    RolledBack,
}

impl AtrState {
    pub fn can_transition(self, to: AtrState) -> bool {
        matches!(
            (self, to),
            (AtrState::Pending, AtrState::Committed)
                | (AtrState::Committed, AtrState::Completed)
                | (AtrState::Pending, AtrState::Aborted)
                | (AtrState::Aborted, AtrState::RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AtrState::Completed | AtrState::RolledBack)
    }
}

/// Reference to one staged document, kept inside the ATR entry so any actor
/// can finish or undo the attempt without the original process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DocRecord {
    pub key: String,
    pub op: StagedOp,
}

/// Per-attempt record inside an ATR document.
///
/// The staged-document lists are append-only during staging and read-only
/// once the attempt moves past the staging phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AtrEntry {
    pub transaction_id: String,
    pub state: AtrState,
    pub started_at: DateTime<Utc>,
    pub expires_after_ms: u64,
    /// Staged document references grouped by target shard.
    #[serde(default)]
    pub docs: BTreeMap<u16, Vec<DocRecord>>,
}

impl AtrEntry {
    /// Any reader may treat an entry past its wall-clock age as expired and
    /// eligible for cleanup, regardless of who nominally owns it.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at)
            > chrono::Duration::milliseconds(self.expires_after_ms as i64)
    }
}

pub(crate) fn decode_attempts(
    body: Option<&Value>,
) -> Result<BTreeMap<String, AtrEntry>, TransactionError> {
    match body.and_then(|body| body.get("attempts")) {
        Some(attempts) => serde_json::from_value(attempts.clone())
            .map_err(|e| TransactionError::Store(e.into())),
        None => Ok(BTreeMap::new()),
    }
}

pub(crate) fn encode_attempts(
    attempts: &BTreeMap<String, AtrEntry>,
) -> Result<Value, TransactionError> {
    let attempts = serde_json::to_value(attempts).map_err(StoreError::from)?;

    Ok(json!({ "attempts": attempts }))
}

enum WriteOutcome {
    Done,
    /// CAS bounced or the write outcome is unknown; re-read and re-apply.
    Retry,
}

/// Owns one attempt's entry in one ATR document.
///
/// Also constructed by the cleanup sweep over entries left behind by other
/// processes; every method is safe to race with the original attempt because
/// each write is CAS-protected and losing a race means re-reading.
pub(crate) struct AtrManager {
    store: DocStore,
    write_opts: WriteOptions,
    pub atr_key: String,
    pub attempt_id: String,
    max_cas_retries: u32,
}

impl AtrManager {
    pub fn new(
        store: DocStore,
        write_opts: WriteOptions,
        atr_key: String,
        attempt_id: String,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            store,
            write_opts,
            atr_key,
            attempt_id,
            max_cas_retries,
        }
    }

    /// Inserts a fresh `Pending` entry. Fails with `Conflict` when an entry
    /// with this attempt id already exists (collisions are retried with a
    /// fresh attempt id, never the same one).
    pub async fn create_pending(&self, entry: AtrEntry) -> Result<(), TransactionError> {
        let mut tries = 0;

        loop {
            self.bump(&mut tries)?;

            let (mut attempts, cas) = self.read_attempts().await?;

            if attempts.contains_key(&self.attempt_id) {
                return Err(TransactionError::Conflict {
                    key: self.atr_key.clone(),
                });
            }

            attempts.insert(self.attempt_id.clone(), entry.clone());

            match self.write_attempts(&attempts, cas).await? {
                WriteOutcome::Done => {
                    trace!(
                        atr = %self.atr_key,
                        attempt = %self.attempt_id,
                        "created pending entry"
                    );

                    return Ok(());
                }
                WriteOutcome::Retry => {
                    // an ambiguous write may have landed
                    if self.read_entry().await?.is_some() {
                        return Ok(());
                    }

                    retry::pause(tries).await;
                }
            }
        }
    }

    /// CAS-protected state transition. The on-store state not matching
    /// `from` means an external actor already acted on this attempt.
    pub async fn transition(&self, from: AtrState, to: AtrState) -> Result<(), TransactionError> {
        debug_assert!(from.can_transition(to));

        let mut tries = 0;

        loop {
            self.bump(&mut tries)?;

            let (mut attempts, cas) = self.read_attempts().await?;

            let Some(entry) = attempts.get_mut(&self.attempt_id) else {
                return Err(TransactionError::StateMismatch {
                    expected: from,
                    found: None,
                });
            };

            if entry.state == to {
                return Ok(());
            }

            if entry.state != from {
                return Err(TransactionError::StateMismatch {
                    expected: from,
                    found: Some(entry.state),
                });
            }

            entry.state = to;

            match self.write_attempts(&attempts, cas).await? {
                WriteOutcome::Done => {
                    trace!(
                        atr = %self.atr_key,
                        attempt = %self.attempt_id,
                        ?from,
                        ?to,
                        "transitioned entry"
                    );

                    return Ok(());
                }
                WriteOutcome::Retry => retry::pause(tries).await,
            }
        }
    }

    /// Rewrites the entry's staged-document lists from the mutation log's
    /// per-shard grouping. The grouping only ever grows while the attempt is
    /// staging, so each rewrite is a superset of the last.
    pub async fn write_records(
        &self,
        docs: BTreeMap<u16, Vec<DocRecord>>,
    ) -> Result<(), TransactionError> {
        let mut tries = 0;

        loop {
            self.bump(&mut tries)?;

            let (mut attempts, cas) = self.read_attempts().await?;

            let Some(entry) = attempts.get_mut(&self.attempt_id) else {
                return Err(TransactionError::StateMismatch {
                    expected: AtrState::Pending,
                    found: None,
                });
            };

            if entry.state != AtrState::Pending {
                return Err(TransactionError::StateMismatch {
                    expected: AtrState::Pending,
                    found: Some(entry.state),
                });
            }

            if entry.docs == docs {
                return Ok(());
            }

            entry.docs = docs.clone();

            match self.write_attempts(&attempts, cas).await? {
                WriteOutcome::Done => return Ok(()),
                WriteOutcome::Retry => retry::pause(tries).await,
            }
        }
    }

    /// Removes the entry from the ATR document. Absent entries count as
    /// pruned; the ATR document itself is never deleted.
    pub async fn prune(&self) -> Result<(), TransactionError> {
        let mut tries = 0;

        loop {
            self.bump(&mut tries)?;

            let (mut attempts, cas) = self.read_attempts().await?;

            if attempts.remove(&self.attempt_id).is_none() || cas.is_zero() {
                return Ok(());
            }

            match self.write_attempts(&attempts, cas).await? {
                WriteOutcome::Done => return Ok(()),
                WriteOutcome::Retry => retry::pause(tries).await,
            }
        }
    }

    pub async fn read_entry(&self) -> Result<Option<AtrEntry>, TransactionError> {
        let (attempts, _) = self.read_attempts().await?;

        Ok(attempts.get(&self.attempt_id).cloned())
    }

    async fn read_attempts(&self) -> Result<(BTreeMap<String, AtrEntry>, Cas), TransactionError> {
        let mut tries = 0;

        loop {
            match self.store.read(&self.atr_key).await {
                Ok(doc) => return Ok((decode_attempts(doc.body.as_ref())?, doc.cas)),
                Err(StoreError::NotFound) => return Ok((BTreeMap::new(), Cas::ZERO)),
                Err(StoreError::Unavailable(_)) | Err(StoreError::AmbiguousTimeout) => {
                    self.bump(&mut tries)?;
                    retry::pause(tries).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_attempts(
        &self,
        attempts: &BTreeMap<String, AtrEntry>,
        cas: Cas,
    ) -> Result<WriteOutcome, TransactionError> {
        let body = encode_attempts(attempts)?;

        match self
            .store
            .cas_write(&self.atr_key, body, cas, &self.write_opts)
            .await
        {
            Ok(_) => Ok(WriteOutcome::Done),
            Err(StoreError::CasMismatch)
            | Err(StoreError::DocumentExists)
            | Err(StoreError::NotFound)
            | Err(StoreError::AmbiguousTimeout)
            | Err(StoreError::Unavailable(_)) => Ok(WriteOutcome::Retry),
            Err(e) => Err(e.into()),
        }
    }

    fn bump(&self, tries: &mut u32) -> Result<(), TransactionError> {
        *tries += 1;

        if *tries > self.max_cas_retries {
            return Err(TransactionError::ConcurrentModification);
        }

        Ok(())
    }
}
