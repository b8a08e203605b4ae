//! Configuration defaults for the transaction coordinator.

use std::time::Duration;

use transakto_store::Durability;

use crate::query::ScanConsistency;

/// Default overall transaction deadline.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15);

/// Default logical shard count. Must match the store's native partitioning
/// mask, and must be a power of two.
pub const DEFAULT_NUM_SHARDS: u16 = 1024;

/// One block holds one active transaction record id per shard. More blocks
/// spread ATR contention across more documents for high-throughput
/// deployments.
pub const DEFAULT_ATR_BLOCKS: usize = 1;

/// Upper bound on ATR blocks.
pub const MAX_ATR_BLOCKS: usize = 20;

/// Default time for one full background sweep over every reachable ATR.
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);

/// How often a CAS-bounced ATR update is re-read and re-applied before the
/// attempt gives up with `ConcurrentModification`.
pub const DEFAULT_ATR_CAS_RETRIES: u32 = 16;

/// Per-transaction query defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    /// Scan consistency applied to statements that do not set their own.
    /// `None` defers to the query engine's default.
    pub scan_consistency: Option<ScanConsistency>,
}

#[derive(Debug, Clone)]
pub struct TransactionsConfig {
    pub expiration: Duration,
    pub num_shards: u16,
    pub atr_blocks: usize,
    pub cleanup_window: Duration,
    /// Run the background sweep that rescues attempts abandoned by crashed
    /// coordinators.
    pub cleanup_lost: bool,
    pub durability: Durability,
    pub atr_cas_retries: u32,
    pub query: QueryConfig,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_EXPIRATION,
            num_shards: DEFAULT_NUM_SHARDS,
            atr_blocks: DEFAULT_ATR_BLOCKS,
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            cleanup_lost: true,
            durability: Durability::default(),
            atr_cas_retries: DEFAULT_ATR_CAS_RETRIES,
            query: QueryConfig::default(),
        }
    }
}

impl TransactionsConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`TransactionsConfig`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: TransactionsConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TransactionsConfig::default(),
        }
    }

    pub fn expiration(mut self, v: Duration) -> Self {
        self.config.expiration = v;

        self
    }

    /// Panics unless `v` is a power of two: the mask must match the store's
    /// native partitioning exactly.
    pub fn num_shards(mut self, v: u16) -> Self {
        assert!(v.is_power_of_two(), "num_shards must be a power of two");
        self.config.num_shards = v;

        self
    }

    /// Panics outside `1..=MAX_ATR_BLOCKS`.
    pub fn atr_blocks(mut self, v: usize) -> Self {
        assert!(
            (1..=MAX_ATR_BLOCKS).contains(&v),
            "atr_blocks must be within 1..={MAX_ATR_BLOCKS}"
        );
        self.config.atr_blocks = v;

        self
    }

    pub fn cleanup_window(mut self, v: Duration) -> Self {
        self.config.cleanup_window = v;

        self
    }

    pub fn cleanup_lost(mut self, v: bool) -> Self {
        self.config.cleanup_lost = v;

        self
    }

    pub fn durability(mut self, v: Durability) -> Self {
        self.config.durability = v;

        self
    }

    pub fn atr_cas_retries(mut self, v: u32) -> Self {
        self.config.atr_cas_retries = v;

        self
    }

    pub fn scan_consistency(mut self, v: ScanConsistency) -> Self {
        self.config.query.scan_consistency = Some(v);

        self
    }

    pub fn build(self) -> TransactionsConfig {
        self.config
    }
}
