//! Backoff helpers behind the retry policy.
//!
//! Operation-level retries are absorbed here; attempt-level retries reuse the
//! same policy values from the orchestrator loop. Both are exponential,
//! jittered, capped, and bounded by the caller's remaining deadline, never by
//! a fixed retry count alone.

use std::time::Duration;

use backoff::ExponentialBackoff;
use transakto_store::{DocStore, Document, StoreError};

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn backoff_until(remaining: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: INITIAL_BACKOFF,
        randomization_factor: 0.5,
        multiplier: 2.0,
        max_interval: MAX_BACKOFF,
        max_elapsed_time: Some(remaining),
        ..ExponentialBackoff::default()
    }
}

/// Reads a document, absorbing transient unavailability and ambiguous
/// timeouts. Re-reading is idempotent, so these retry without further
/// ceremony.
pub(crate) async fn read_with_retry(
    store: &DocStore,
    key: &str,
    remaining: Duration,
) -> Result<Document, StoreError> {
    backoff::future::retry(backoff_until(remaining), || async {
        match store.read(key).await {
            Err(err @ (StoreError::Unavailable(_) | StoreError::AmbiguousTimeout)) => {
                Err(backoff::Error::transient(err))
            }
            other => other.map_err(backoff::Error::permanent),
        }
    })
    .await
}

/// Short capped pause inside bounded CAS loops.
pub(crate) async fn pause(tries: u32) {
    tokio::time::sleep(Duration::from_millis(1 << tries.clamp(1, 6))).await;
}
