//! In-memory implementation of the state backend.
//!
//! # Purpose
//! Implements `StateBackend` entirely in memory using `HashMap`s guarded by
//! `tokio::sync::RwLock`. It exists for local development and tests (no
//! external dependencies). Not durable: all state is lost on restart.
//!
//! # Semantics
//! Routing, etag, and TTL behavior mirror the Postgres backend: targets are
//! derived by the same routing helper, etags are generated UUIDs compared on
//! conditional writes, and expired rows are invisible to readers (reclaimed
//! lazily on read rather than by the janitor).

use super::{
    DeleteOp, SetOp, StateBackend, StoreError, StoreResult, StoredValue, TransactOp, parse_etag,
};
use crate::routing::{self, StateStoreConfig, Target};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct MemRow {
    value: Value,
    etag: Uuid,
    expires_at: Option<DateTime<Utc>>,
}

impl MemRow {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

type Targets = HashMap<Target, HashMap<String, MemRow>>;

pub struct InMemoryBackend {
    config: StateStoreConfig,
    targets: RwLock<Targets>,
}

impl InMemoryBackend {
    pub fn new(config: StateStoreConfig) -> Self {
        Self {
            config,
            targets: RwLock::new(HashMap::new()),
        }
    }
}

/// Apply one operation to the working map. Used both for single operations
/// and inside `transact`, where the working map is a scratch copy.
fn apply(targets: &mut Targets, config: &StateStoreConfig, op: &TransactOp) -> StoreResult<()> {
    match op {
        TransactOp::Set(set) => {
            let target = config.resolve_target(&set.metadata)?;
            let expected = set.etag.as_deref().map(parse_etag).transpose()?;
            let ttl = routing::ttl_from_metadata(&set.metadata)?;
            let expires_at = match ttl {
                Some(secs) if secs > 0 => Some(Utc::now() + ChronoDuration::seconds(secs)),
                _ => None,
            };

            let rows = targets.entry(target).or_default();
            if let Some(expected) = expected {
                let matched = rows
                    .get(&set.key)
                    .filter(|row| !row.expired())
                    .is_some_and(|row| row.etag == expected);
                if !matched {
                    return Err(StoreError::EtagMismatch(set.key.clone()));
                }
            }
            rows.insert(
                set.key.clone(),
                MemRow {
                    value: set.value.clone(),
                    etag: Uuid::new_v4(),
                    expires_at,
                },
            );
            Ok(())
        }
        TransactOp::Delete(del) => {
            let target = config.resolve_target(&del.metadata)?;
            let expected = del.etag.as_deref().map(parse_etag).transpose()?;
            let Some(rows) = targets.get_mut(&target) else {
                // Unprovisioned target: a missing table means missing data,
                // so the delete is a no-op even when conditional, matching
                // how the durable backend's TableMissing is treated.
                return Ok(());
            };
            match expected {
                None => {
                    rows.remove(&del.key);
                    Ok(())
                }
                Some(expected) => {
                    let matched = rows
                        .get(&del.key)
                        .filter(|row| !row.expired())
                        .is_some_and(|row| row.etag == expected);
                    if !matched {
                        return Err(StoreError::EtagMismatch(del.key.clone()));
                    }
                    rows.remove(&del.key);
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl StateBackend for InMemoryBackend {
    async fn get(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StoreResult<Option<StoredValue>> {
        let target = self.config.resolve_target(metadata)?;
        {
            let targets = self.targets.read().await;
            match targets.get(&target).and_then(|rows| rows.get(key)) {
                None => return Ok(None),
                Some(row) if !row.expired() => {
                    return Ok(Some(StoredValue {
                        value: row.value.clone(),
                        etag: row.etag,
                    }));
                }
                Some(_) => {}
            }
        }
        // Expired: reclaim lazily under the write lock, re-checking since
        // the row may have been replaced between lock grades.
        let mut targets = self.targets.write().await;
        if let Some(rows) = targets.get_mut(&target) {
            if rows.get(key).is_some_and(MemRow::expired) {
                rows.remove(key);
            }
        }
        Ok(None)
    }

    async fn set(&self, op: SetOp) -> StoreResult<()> {
        let mut targets = self.targets.write().await;
        apply(&mut targets, &self.config, &TransactOp::Set(op))
    }

    async fn delete(&self, op: DeleteOp) -> StoreResult<()> {
        let mut targets = self.targets.write().await;
        apply(&mut targets, &self.config, &TransactOp::Delete(op))
    }

    async fn transact(&self, ops: Vec<TransactOp>) -> StoreResult<()> {
        let mut targets = self.targets.write().await;
        // All-or-nothing: run the batch against a scratch copy and swap it
        // in only when every operation succeeded. Fine at dev/test scale.
        let mut working = targets.clone();
        for op in &ops {
            apply(&mut working, &self.config, op)?;
        }
        *targets = working;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{METADATA_TENANT_ID, METADATA_TTL};
    use serde_json::json;

    fn backend(tenant_mode: Option<&str>) -> InMemoryBackend {
        let mut props = HashMap::from([(
            "connectionString".to_string(),
            "postgres://unused".to_string(),
        )]);
        if let Some(mode) = tenant_mode {
            props.insert("tenant".to_string(), mode.to_string());
        }
        InMemoryBackend::new(StateStoreConfig::from_properties(&props).unwrap())
    }

    fn tenant_metadata(tenant: &str) -> HashMap<String, String> {
        HashMap::from([(METADATA_TENANT_ID.to_string(), tenant.to_string())])
    }

    fn set_op(key: &str, value: Value, metadata: HashMap<String, String>) -> SetOp {
        SetOp {
            key: key.to_string(),
            value,
            etag: None,
            metadata,
        }
    }

    #[tokio::test]
    async fn set_get_roundtrip_within_tenant() {
        let backend = backend(Some("schema"));
        backend
            .set(set_op("k", json!({"TestStr": "foo", "TestInt": 99999}), tenant_metadata("T1")))
            .await
            .unwrap();
        let stored = backend.get("k", &tenant_metadata("T1")).await.unwrap().unwrap();
        assert_eq!(stored.value, json!({"TestStr": "foo", "TestInt": 99999}));
    }

    #[tokio::test]
    async fn tenants_are_isolated_even_on_key_collision() {
        let backend = backend(Some("schema"));
        backend
            .set(set_op("k", json!("v"), tenant_metadata("T1")))
            .await
            .unwrap();
        assert!(backend.get("k", &tenant_metadata("T2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_set_follows_etag_lifecycle() {
        let backend = backend(None);
        backend.set(set_op("k", json!("v1"), HashMap::new())).await.unwrap();
        let first = backend.get("k", &HashMap::new()).await.unwrap().unwrap();

        let mut update = set_op("k", json!("v2"), HashMap::new());
        update.etag = Some(first.etag.to_string());
        backend.set(update).await.unwrap();

        let second = backend.get("k", &HashMap::new()).await.unwrap().unwrap();
        assert_eq!(second.value, json!("v2"));
        assert_ne!(second.etag, first.etag);

        // Replaying the old etag fails and leaves the row untouched.
        let mut stale = set_op("k", json!("v3"), HashMap::new());
        stale.etag = Some(first.etag.to_string());
        assert!(matches!(
            backend.set(stale).await,
            Err(StoreError::EtagMismatch(_))
        ));
        let after = backend.get("k", &HashMap::new()).await.unwrap().unwrap();
        assert_eq!(after.value, json!("v2"));
    }

    #[tokio::test]
    async fn malformed_etag_is_invalid_not_mismatch() {
        let backend = backend(None);
        let mut op = set_op("k", json!("v"), HashMap::new());
        op.etag = Some("not-a-valid-etag".to_string());
        assert!(matches!(
            backend.set(op).await,
            Err(StoreError::EtagInvalid(_))
        ));
    }

    #[tokio::test]
    async fn delete_with_wrong_etag_keeps_row() {
        let backend = backend(None);
        backend.set(set_op("k", json!("v"), HashMap::new())).await.unwrap();
        let err = backend
            .delete(DeleteOp {
                key: "k".to_string(),
                etag: Some(Uuid::new_v4().to_string()),
                metadata: HashMap::new(),
            })
            .await;
        assert!(matches!(err, Err(StoreError::EtagMismatch(_))));
        assert!(backend.get("k", &HashMap::new()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conditional_delete_against_unwritten_tenant_is_a_noop() {
        let backend = backend(Some("schema"));
        backend
            .delete(DeleteOp {
                key: "k".to_string(),
                etag: Some(Uuid::new_v4().to_string()),
                metadata: tenant_metadata("never-written"),
            })
            .await
            .unwrap();

        // A malformed token is still classified before the target lookup.
        let err = backend
            .delete(DeleteOp {
                key: "k".to_string(),
                etag: Some("not-a-valid-etag".to_string()),
                metadata: tenant_metadata("never-written"),
            })
            .await;
        assert!(matches!(err, Err(StoreError::EtagInvalid(_))));
    }

    #[tokio::test]
    async fn transact_rolls_back_on_first_failure() {
        let backend = backend(None);
        let ops = vec![
            TransactOp::Set(set_op("a", json!("1"), HashMap::new())),
            TransactOp::Delete(DeleteOp {
                key: "missing".to_string(),
                etag: Some(Uuid::new_v4().to_string()),
                metadata: HashMap::new(),
            }),
        ];
        assert!(backend.transact(ops).await.is_err());
        assert!(backend.get("a", &HashMap::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_rows_are_invisible() {
        let backend = backend(None);
        let metadata = HashMap::from([(METADATA_TTL.to_string(), "1".to_string())]);
        backend
            .set(set_op("k", json!("v"), metadata))
            .await
            .unwrap();
        assert!(backend.get("k", &HashMap::new()).await.unwrap().is_some());
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(backend.get("k", &HashMap::new()).await.unwrap().is_none());
    }
}
