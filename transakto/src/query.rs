//! Query pass-through to an external execution engine.

use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

/// Scan consistency for query statements issued inside an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Left unset, the per-transaction default applies; with both unset the
    /// query engine's own default wins.
    pub scan_consistency: Option<ScanConsistency>,
    pub positional_parameters: Vec<Value>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan_consistency(mut self, v: ScanConsistency) -> Self {
        self.scan_consistency = Some(v);

        self
    }

    pub fn parameter(mut self, v: Value) -> Self {
        self.positional_parameters.push(v);

        self
    }
}

/// Executes query statements on behalf of an attempt. Execution itself is an
/// external collaborator; the coordinator only threads options through.
#[async_trait]
pub trait QueryExecutor: DynClone + Send + Sync {
    async fn query(&self, statement: &str, options: QueryOptions) -> anyhow::Result<Vec<Value>>;
}

dyn_clone::clone_trait_object!(QueryExecutor);
