use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

use crate::{
    document::{Cas, Document, StagedPayload, WriteOptions},
    error::Result,
};

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::*;

/// Single-document operations of the underlying store.
///
/// Every mutation is CAS-protected; the store offers no multi-document
/// atomicity. The staging area travels with the document but is invisible to
/// canonical readers until promoted by [`Engine::cas_write`] /
/// [`Engine::cas_delete`].
#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Reads the canonical body and the staging area. Fails with
    /// [`crate::StoreError::NotFound`] only when neither exists.
    async fn read(&self, key: &str) -> Result<Document>;

    /// CAS-protected canonical write, clearing the staging area in the same
    /// operation. [`Cas::ZERO`] inserts and fails with
    /// [`crate::StoreError::DocumentExists`] when the document (or an insert
    /// shell) is already there.
    async fn cas_write(&self, key: &str, body: Value, cas: Cas, opts: &WriteOptions)
        -> Result<Cas>;

    /// CAS-protected removal of the whole document, staging included.
    async fn cas_delete(&self, key: &str, cas: Cas, opts: &WriteOptions) -> Result<()>;

    /// Writes the staging area without altering the canonical body.
    /// [`Cas::ZERO`] creates an insert shell.
    async fn write_staged(
        &self,
        key: &str,
        payload: StagedPayload,
        cas: Cas,
        opts: &WriteOptions,
    ) -> Result<Cas>;

    /// Clears only the staging area, canonical body untouched. Clearing the
    /// staging area of an insert shell removes the shell and returns
    /// [`Cas::ZERO`].
    async fn clear_staged(&self, key: &str, cas: Cas, opts: &WriteOptions) -> Result<Cas>;
}

dyn_clone::clone_trait_object!(Engine);

/// Cloneable facade over a boxed [`Engine`].
#[derive(Clone)]
pub struct DocStore {
    engine: Box<dyn Engine>,
}

impl DocStore {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn read(&self, key: &str) -> Result<Document> {
        self.engine.read(key).await
    }

    pub async fn cas_write(
        &self,
        key: &str,
        body: Value,
        cas: Cas,
        opts: &WriteOptions,
    ) -> Result<Cas> {
        self.engine.cas_write(key, body, cas, opts).await
    }

    pub async fn cas_delete(&self, key: &str, cas: Cas, opts: &WriteOptions) -> Result<()> {
        self.engine.cas_delete(key, cas, opts).await
    }

    pub async fn write_staged(
        &self,
        key: &str,
        payload: StagedPayload,
        cas: Cas,
        opts: &WriteOptions,
    ) -> Result<Cas> {
        self.engine.write_staged(key, payload, cas, opts).await
    }

    pub async fn clear_staged(&self, key: &str, cas: Cas, opts: &WriteOptions) -> Result<Cas> {
        self.engine.clear_staged(key, cas, opts).await
    }
}
