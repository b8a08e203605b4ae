//! Per-attempt log of intended document changes.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::Value;
use transakto_store::{Cas, StagedOp};

/// One document's role in an attempt.
#[derive(Debug, Clone)]
pub(crate) struct StagedMutation {
    pub key: String,
    pub shard: u16,
    pub op: StagedOp,
    /// `None` only for removes.
    pub content: Option<Value>,
    /// CAS observed before the attempt touched the document.
    pub pre_cas: Cas,
    /// CAS returned by the staging write; the unstage/rollback token.
    pub staged_cas: Cas,
}

/// Append-only log of staged mutations, in staging order.
///
/// Re-staging a key already in the log updates that entry in place, so
/// commit and rollback consume each document exactly once. The log never
/// shrinks during an attempt's life.
#[derive(Default)]
pub(crate) struct StagedMutationLog {
    entries: Mutex<Vec<StagedMutation>>,
}

impl StagedMutationLog {
    pub fn stage(&self, mutation: StagedMutation) {
        let mut entries = self.entries.lock();

        match entries.iter_mut().find(|m| m.key == mutation.key) {
            Some(existing) => *existing = mutation,
            None => entries.push(mutation),
        }
    }

    pub fn get(&self, key: &str) -> Option<StagedMutation> {
        self.entries.lock().iter().find(|m| m.key == key).cloned()
    }

    /// Every entry, in staging order.
    pub fn all(&self) -> Vec<StagedMutation> {
        self.entries.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Entries grouped by target shard, for batched ATR updates.
    pub fn for_each_shard(&self) -> BTreeMap<u16, Vec<StagedMutation>> {
        let mut grouped: BTreeMap<u16, Vec<StagedMutation>> = BTreeMap::new();

        for mutation in self.entries.lock().iter() {
            grouped
                .entry(mutation.shard)
                .or_default()
                .push(mutation.clone());
        }

        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(key: &str, shard: u16, op: StagedOp, content: Option<Value>) -> StagedMutation {
        StagedMutation {
            key: key.to_owned(),
            shard,
            op,
            content,
            pre_cas: Cas::ZERO,
            staged_cas: Cas(1),
        }
    }

    #[test]
    fn preserves_staging_order() {
        let log = StagedMutationLog::default();

        log.stage(mutation("b", 1, StagedOp::Insert, Some(json!(1))));
        log.stage(mutation("a", 2, StagedOp::Replace, Some(json!(2))));
        log.stage(mutation("c", 1, StagedOp::Remove, None));

        let keys: Vec<_> = log.all().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn restaging_updates_in_place() {
        let log = StagedMutationLog::default();

        log.stage(mutation("a", 2, StagedOp::Insert, Some(json!(1))));
        log.stage(mutation("b", 1, StagedOp::Replace, Some(json!(2))));
        log.stage(mutation("a", 2, StagedOp::Insert, Some(json!(3))));

        assert_eq!(log.len(), 2);

        let keys: Vec<_> = log.all().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, ["a", "b"]);

        assert_eq!(log.get("a").unwrap().content, Some(json!(3)));
    }

    #[test]
    fn groups_by_shard() {
        let log = StagedMutationLog::default();

        log.stage(mutation("a", 2, StagedOp::Insert, Some(json!(1))));
        log.stage(mutation("b", 1, StagedOp::Replace, Some(json!(2))));
        log.stage(mutation("c", 2, StagedOp::Remove, None));

        let grouped = log.for_each_shard();

        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped[&2].iter().map(|m| m.key.as_str()).collect::<Vec<_>>(),
            ["a", "c"]
        );
        assert_eq!(grouped[&1].len(), 1);
    }
}
