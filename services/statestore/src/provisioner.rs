//! Memoized create-if-absent gate for per-tenant resources.
//!
//! READ COMMITTED isolation is used throughout the component, so N
//! concurrent first-writes against a new target would each race a
//! `CREATE ... IF NOT EXISTS` on the system catalogs. This gate serializes
//! provisioning per resource in-process; cross-process, `IF NOT EXISTS`
//! remains the backstop.
//!
//! The memo is keyed by resource name, never by a provisioning task, so
//! tasks are ephemeral and discarded after completion.

use crate::store::StoreResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Process-wide map from resource key to its completion cell.
///
/// `ensure` runs the factory exactly once per key per process lifetime on
/// success. Concurrent callers for the same key block until the first
/// completes; callers for distinct keys do not contend. A failed (or
/// cancelled) factory is not memoized, so a later call retries.
#[derive(Default)]
pub struct Provisioner {
    cells: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure<F, Fut>(&self, key: &str, factory: F) -> StoreResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let cell = {
            let mut cells = self
                .cells
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cells.entry(key.to_string()).or_default().clone()
        };
        // OnceCell serializes initializers per key and only records success.
        cell.get_or_try_init(factory).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn factory_runs_exactly_once_under_contention() {
        let provisioner = Arc::new(Provisioner::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let provisioner = Arc::clone(&provisioner);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                provisioner
                    .ensure("T:public.state", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let provisioner = Provisioner::new();
        let calls = AtomicUsize::new(0);

        let first = provisioner
            .ensure("S:broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transport("connection refused".into()))
            })
            .await;
        assert!(first.is_err());

        provisioner
            .ensure("S:broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Memoized now: the factory must not run again.
        provisioner
            .ensure("S:broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_provision_independently() {
        let provisioner = Provisioner::new();
        let calls = AtomicUsize::new(0);
        for key in ["S:a", "S:b", "T:a.x", "T:b.x"] {
            provisioner
                .ensure(key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
