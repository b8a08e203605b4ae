use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compare-and-swap token proving a writer observed a specific prior version
/// of a document.
///
/// On writes, [`Cas::ZERO`] means the document must not exist yet, mirroring
/// insert semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl Cas {
    pub const ZERO: Cas = Cas(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Cas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation kind carried by a staged payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedOp {
    Insert,
    Replace,
    Remove,
}

/// A tentative change parked out-of-band from the canonical body, invisible
/// to non-transactional readers until promoted.
///
/// `atr_key` points at the active transaction record holding the staking
/// attempt's entry, so any reader can resolve whether that attempt is still
/// live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedPayload {
    pub transaction_id: String,
    pub attempt_id: String,
    pub op: StagedOp,
    /// `None` only for [`StagedOp::Remove`].
    pub content: Option<Value>,
    pub atr_key: String,
    pub staged_at: DateTime<Utc>,
}

/// Read result: the canonical body plus whatever sits in the staging area.
///
/// `body == None` together with a staged payload is an insert shell, a
/// document created only to carry staging for a key that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: String,
    pub body: Option<Value>,
    pub cas: Cas,
    pub staged: Option<StagedPayload>,
}

/// Durability required of a write before the store acknowledges it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Durability {
    None,
    #[default]
    Majority,
    MajorityAndPersist,
    PersistToMajority,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub durability: Durability,
}

impl WriteOptions {
    pub fn new(durability: Durability) -> Self {
        Self { durability }
    }
}
