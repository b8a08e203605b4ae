use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use transakto::{
    AbortHandle, AtrState, FailureOutcome, QueryExecutor, QueryOptions, ScanConsistency,
    TransactionError, TransactionOptions, Transactions,
};
use transakto_store::{Memory, StoreError};

mod common;

use common::{config, seed, transactions};

#[tokio::test]
async fn commit_end_to_end() {
    let store = Memory::store();
    seed(&store, "order-1", json!({"status": "new"})).await;
    seed(&store, "order-2", json!({"status": "stale"})).await;

    let txns = transactions(&store);

    let result = txns
        .run(|ctx| async move {
            let order = ctx.get("order-1").await?;
            ctx.replace(&order, json!({"status": "paid"})).await?;
            ctx.insert("receipt-1", json!({"order": "order-1"})).await?;

            let stale = ctx.get("order-2").await?;
            ctx.remove(stale).await?;

            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].state, AtrState::Completed);
    assert!(result.unstaging_complete);
    assert_eq!(result.mutated, ["order-1", "receipt-1", "order-2"]);

    assert_eq!(
        store.read("order-1").await.unwrap().body,
        Some(json!({"status": "paid"}))
    );
    assert_eq!(
        store.read("receipt-1").await.unwrap().body,
        Some(json!({"order": "order-1"}))
    );
    assert!(matches!(
        store.read("order-2").await.unwrap_err(),
        StoreError::NotFound
    ));

    txns.close().await;
}

#[tokio::test]
async fn empty_transaction_commits_trivially() {
    let store = Memory::store();
    let txns = transactions(&store);

    let result = txns.run(|_ctx| async move { Ok(()) }).await.unwrap();

    assert_eq!(result.attempts.len(), 1);
    assert!(result.mutated.is_empty());
}

#[tokio::test]
async fn logic_error_rolls_back() {
    let store = Memory::store();
    seed(&store, "order-1", json!({"status": "new"})).await;

    let txns = transactions(&store);

    let failed = txns
        .run(|ctx| async move {
            let order = ctx.get("order-1").await?;
            ctx.replace(&order, json!({"status": "paid"})).await?;

            anyhow::bail!("card declined")
        })
        .await
        .unwrap_err();

    assert!(matches!(failed.error, TransactionError::Logic(_)));
    assert_eq!(failed.outcome, FailureOutcome::RolledBack);
    assert_eq!(failed.result.attempts.len(), 1);
    assert_eq!(failed.result.attempts[0].state, AtrState::RolledBack);

    // no staged value, no marker, original content intact
    let doc = store.read("order-1").await.unwrap();
    assert_eq!(doc.body, Some(json!({"status": "new"})));
    assert!(doc.staged.is_none());
}

#[tokio::test]
async fn retryable_failure_starts_a_fresh_attempt() {
    let store = Memory::store();
    seed(&store, "order-1", json!({"total": 10})).await;

    let txns = transactions(&store);
    let tries = Arc::new(AtomicU32::new(0));

    let result = txns
        .run({
            let tries = tries.clone();

            move |ctx| {
                let tries = tries.clone();

                async move {
                    let doc = ctx.get("order-1").await?;
                    ctx.replace(&doc, json!({"total": 20})).await?;

                    if tries.fetch_add(1, Ordering::SeqCst) == 0 {
                        // simulated conflict signal from a collaborator
                        return Err(TransactionError::WriteWriteConflict {
                            key: "order-1".to_owned(),
                        }
                        .into());
                    }

                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(tries.load(Ordering::SeqCst), 2);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].state, AtrState::RolledBack);
    assert!(result.attempts[0].error.is_some());
    assert_eq!(result.attempts[1].state, AtrState::Completed);

    // the rolled-back first attempt left nothing behind
    let doc = store.read("order-1").await.unwrap();
    assert_eq!(doc.body, Some(json!({"total": 20})));
    assert!(doc.staged.is_none());
}

#[tokio::test]
async fn expired_transaction_fails() {
    let store = Memory::store();
    seed(&store, "order-1", json!({"total": 10})).await;

    let txns = Transactions::new(store.clone(), config().build());

    let failed = txns
        .run_with(
            TransactionOptions::new().expiration(Duration::from_millis(20)),
            |ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;

                let doc = ctx.get("order-1").await?;
                ctx.replace(&doc, json!({"total": 20})).await?;

                Ok(())
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(failed.error, TransactionError::Expired));
    assert_eq!(failed.outcome, FailureOutcome::RolledBack);

    assert_eq!(
        store.read("order-1").await.unwrap().body,
        Some(json!({"total": 10}))
    );
}

#[tokio::test]
async fn external_abort_surfaces_between_attempts() {
    let store = Memory::store();
    seed(&store, "order-1", json!({"total": 10})).await;

    let txns = transactions(&store);
    let abort = AbortHandle::new();

    let failed = txns
        .run_with(TransactionOptions::new().abort_handle(abort.clone()), {
            let abort = abort.clone();

            move |ctx| {
                let abort = abort.clone();

                async move {
                    let doc = ctx.get("order-1").await?;
                    ctx.replace(&doc, json!({"total": 20})).await?;

                    // the outside actor cancels while this attempt fails
                    abort.abort();

                    Err(TransactionError::Conflict {
                        key: "order-1".to_owned(),
                    }
                    .into())
                }
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(failed.error, TransactionError::AbortedExternally));
    assert_eq!(failed.result.attempts.len(), 1);

    let doc = store.read("order-1").await.unwrap();
    assert_eq!(doc.body, Some(json!({"total": 10})));
    assert!(doc.staged.is_none());
}

#[tokio::test]
async fn concurrent_transactions_on_disjoint_keys_all_commit() {
    let store = Memory::store();
    let txns = Arc::new(transactions(&store));

    let results = join_all((0..4).map(|i| {
        let txns = txns.clone();

        async move {
            txns.run(move |ctx| async move {
                ctx.insert(format!("doc-{i}"), json!({"n": i})).await?;

                Ok(())
            })
            .await
        }
    }))
    .await;

    for result in results {
        result.unwrap();
    }

    for i in 0..4 {
        assert_eq!(
            store.read(&format!("doc-{i}")).await.unwrap().body,
            Some(json!({"n": i}))
        );
    }
}

#[derive(Clone, Default)]
struct RecordingExecutor(Arc<Mutex<Vec<QueryOptions>>>);

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn query(
        &self,
        _statement: &str,
        options: QueryOptions,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        self.0.lock().unwrap().push(options);

        Ok(vec![])
    }
}

#[tokio::test]
async fn query_scan_consistency_defaults_stay_unset() {
    let store = Memory::store();
    let recorder = RecordingExecutor::default();

    let txns = Transactions::new(store.clone(), config().build())
        .query_executor(recorder.clone());

    txns.run(|ctx| async move {
        ctx.query("SELECT 1", QueryOptions::new()).await?;

        Ok(())
    })
    .await
    .unwrap();

    // nothing configured, nothing set: the engine's own default applies
    let recorded = recorder.0.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].scan_consistency.is_none());
}

#[tokio::test]
async fn query_scan_consistency_fills_from_config() {
    let store = Memory::store();
    let recorder = RecordingExecutor::default();

    let txns = Transactions::new(
        store.clone(),
        config().scan_consistency(ScanConsistency::RequestPlus).build(),
    )
    .query_executor(recorder.clone());

    txns.run(|ctx| async move {
        ctx.query("SELECT 1", QueryOptions::new()).await?;

        ctx.query(
            "SELECT 2",
            QueryOptions::new().scan_consistency(ScanConsistency::NotBounded),
        )
        .await?;

        Ok(())
    })
    .await
    .unwrap();

    let recorded = recorder.0.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    // the transaction default applies only when the per-call value is unset
    assert_eq!(
        recorded[0].scan_consistency,
        Some(ScanConsistency::RequestPlus)
    );
    assert_eq!(
        recorded[1].scan_consistency,
        Some(ScanConsistency::NotBounded)
    );
}

#[tokio::test]
async fn query_without_executor_fails() {
    let store = Memory::store();
    let txns = transactions(&store);

    let failed = txns
        .run(|ctx| async move {
            ctx.query("SELECT 1", QueryOptions::new()).await?;

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(failed.error, TransactionError::Query(_)));
}
