use serde_json::Value;
use transakto::{ConfigBuilder, Transactions, TransactionsConfig};
use transakto_store::{Cas, DocStore, Memory, WriteOptions};

pub fn config() -> ConfigBuilder {
    TransactionsConfig::builder()
        .num_shards(4)
        .cleanup_lost(false)
}

pub fn transactions(store: &DocStore) -> Transactions {
    Transactions::new(store.clone(), config().build())
}

pub async fn seed(store: &DocStore, key: &str, content: Value) -> Cas {
    store
        .cas_write(key, content, Cas::ZERO, &WriteOptions::default())
        .await
        .unwrap()
}
