use transakto_store::StoreError;

use crate::{atr::AtrState, transactions::TransactionResult};

/// Failure taxonomy of the transaction protocol.
///
/// Every expected-but-retryable condition is an explicit variant so the
/// retry classifier operates on a value, never on an unwound call stack.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("document not found")]
    DocumentNotFound,

    #[error("document already exists")]
    DocumentAlreadyExists,

    #[error("document `{key}` is staged by another live attempt")]
    WriteWriteConflict { key: String },

    #[error("another writer holds `{key}`")]
    Conflict { key: String },

    #[error("active transaction record changed concurrently")]
    ConcurrentModification,

    #[error("attempt entry state diverged (expected {expected:?}, found {found:?})")]
    StateMismatch {
        expected: AtrState,
        found: Option<AtrState>,
    },

    #[error("attempt expired")]
    Expired,

    #[error("transaction aborted by an outside actor")]
    AbortedExternally,

    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    #[error("store `{0}`")]
    Store(#[from] StoreError),

    #[error("query `{0}`")]
    Query(#[source] anyhow::Error),

    #[error("{0}")]
    Logic(#[source] anyhow::Error),
}

/// What the retry policy does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The transaction fails permanently and is reported to the caller.
    FailsTransaction,
    /// The whole attempt is abandoned and a fresh one started.
    RetryTransaction,
    /// Only the failed store operation is retried, after a re-read.
    RetryOperation,
}

impl TransactionError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            TransactionError::WriteWriteConflict { .. }
            | TransactionError::Conflict { .. }
            | TransactionError::ConcurrentModification
            | TransactionError::StateMismatch { .. }
            | TransactionError::Store(StoreError::CasMismatch) => ErrorClass::RetryTransaction,
            TransactionError::Store(StoreError::Unavailable(_))
            | TransactionError::Store(StoreError::AmbiguousTimeout) => ErrorClass::RetryOperation,
            _ => ErrorClass::FailsTransaction,
        }
    }
}

/// Where the failed transaction's durable state ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// All staged changes were undone.
    RolledBack,
    /// The commit decision was persisted; the cleanup sweep finishes the
    /// remaining unstaging.
    Committed,
    /// The outcome could not be determined.
    Unknown,
}

/// Terminal failure reported to the caller, carrying the classified error
/// and the accumulated attempt history for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("transaction {} failed ({:?}): {}", .result.transaction_id, .outcome, .error)]
pub struct TransactionFailed {
    pub error: TransactionError,
    pub outcome: FailureOutcome,
    pub result: TransactionResult,
}
