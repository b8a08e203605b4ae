use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    document::{Cas, Document, StagedPayload, WriteOptions},
    engine::{DocStore, Engine},
    error::{Result, StoreError},
};

#[derive(Debug, Clone)]
struct Stored {
    body: Option<Value>,
    staged: Option<StagedPayload>,
    cas: u64,
}

/// In-memory engine with real CAS semantics, for tests and examples.
///
/// CAS tokens are drawn from one monotonically increasing counter so a stale
/// token never matches again, even across different keys.
#[derive(Clone, Default)]
pub struct Memory {
    docs: Arc<RwLock<HashMap<String, Stored>>>,
    next_cas: Arc<AtomicU64>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store() -> DocStore {
        DocStore::new(Self::new())
    }

    fn bump(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl Engine for Memory {
    async fn read(&self, key: &str) -> Result<Document> {
        let docs = self.docs.read();
        let stored = docs.get(key).ok_or(StoreError::NotFound)?;

        Ok(Document {
            key: key.to_owned(),
            body: stored.body.clone(),
            cas: Cas(stored.cas),
            staged: stored.staged.clone(),
        })
    }

    async fn cas_write(
        &self,
        key: &str,
        body: Value,
        cas: Cas,
        _opts: &WriteOptions,
    ) -> Result<Cas> {
        let mut docs = self.docs.write();

        match docs.get_mut(key) {
            Some(stored) => {
                if cas.is_zero() {
                    return Err(StoreError::DocumentExists);
                }

                if stored.cas != cas.0 {
                    return Err(StoreError::CasMismatch);
                }

                stored.body = Some(body);
                stored.staged = None;
                stored.cas = self.bump();

                Ok(Cas(stored.cas))
            }
            None => {
                if !cas.is_zero() {
                    return Err(StoreError::NotFound);
                }

                let cas = self.bump();
                docs.insert(
                    key.to_owned(),
                    Stored {
                        body: Some(body),
                        staged: None,
                        cas,
                    },
                );

                Ok(Cas(cas))
            }
        }
    }

    async fn cas_delete(&self, key: &str, cas: Cas, _opts: &WriteOptions) -> Result<()> {
        let mut docs = self.docs.write();
        let stored = docs.get(key).ok_or(StoreError::NotFound)?;

        if cas.is_zero() || stored.cas != cas.0 {
            return Err(StoreError::CasMismatch);
        }

        docs.remove(key);

        Ok(())
    }

    async fn write_staged(
        &self,
        key: &str,
        payload: StagedPayload,
        cas: Cas,
        _opts: &WriteOptions,
    ) -> Result<Cas> {
        let mut docs = self.docs.write();

        match docs.get_mut(key) {
            Some(stored) => {
                if cas.is_zero() {
                    return Err(StoreError::DocumentExists);
                }

                if stored.cas != cas.0 {
                    return Err(StoreError::CasMismatch);
                }

                stored.staged = Some(payload);
                stored.cas = self.bump();

                Ok(Cas(stored.cas))
            }
            None => {
                if !cas.is_zero() {
                    return Err(StoreError::NotFound);
                }

                let cas = self.bump();
                docs.insert(
                    key.to_owned(),
                    Stored {
                        body: None,
                        staged: Some(payload),
                        cas,
                    },
                );

                Ok(Cas(cas))
            }
        }
    }

    async fn clear_staged(&self, key: &str, cas: Cas, _opts: &WriteOptions) -> Result<Cas> {
        let mut docs = self.docs.write();
        let stored = docs.get_mut(key).ok_or(StoreError::NotFound)?;

        if cas.is_zero() || stored.cas != cas.0 {
            return Err(StoreError::CasMismatch);
        }

        if stored.body.is_none() {
            docs.remove(key);
            return Ok(Cas::ZERO);
        }

        stored.staged = None;
        stored.cas = self.bump();

        Ok(Cas(stored.cas))
    }
}
