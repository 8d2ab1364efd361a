//! Postgres-backed state store with per-tenant routing.
//!
//! # What this module is
//! The durable `StateBackend`: a thin relational adapter executing
//! parameterized CRUD and DDL against dynamic `(schema, table)` targets,
//! plus the backend glue that owns the pool, the provisioning memo, and the
//! TTL janitor's lifecycle.
//!
//! # SQL injection surface
//! Identifier-level interpolation is required to address a dynamic schema
//! and table. It is strictly confined to identifiers produced by
//! `routing::quote_ident` from targets the routing helper derived; every
//! user-controlled value (keys, documents, etags, expiries) flows through
//! bound parameters. Deletes additionally go through the
//! `pluggable_metadata.delete_key_v1` / `delete_key_with_etag_v1` helper
//! functions bound by regclass, so their statement text is constant.
//!
//! # Concurrency
//! Operations run under READ COMMITTED. Optimistic concurrency is carried by
//! the `etag uuid` column: every successful write stores a fresh UUID, and
//! conditional writes compare the stored value against a caller-supplied
//! token parsed before any SQL is sent.

use super::{
    DeleteOp, SetOp, StateBackend, StoreError, StoreResult, StoredValue, TransactOp, parse_etag,
};
use crate::janitor;
use crate::provisioner::Provisioner;
use crate::routing::{self, StateStoreConfig, Target};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// SQLSTATE for "relation does not exist".
const UNDEFINED_TABLE: &str = "42P01";

// Pool tuning: cap concurrent DB work and fail fast when the database is
// unhealthy instead of hanging request handlers indefinitely.
const MAX_CONNECTIONS: u32 = 16;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable state backend. Cheap to share: all fields are handles.
pub struct PostgresBackend {
    pool: PgPool,
    config: StateStoreConfig,
    provisioner: Provisioner,
    janitor_shutdown: watch::Sender<bool>,
    janitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresBackend {
    /// Connect, apply the metadata-schema migrations, probe connectivity,
    /// and start the TTL janitor.
    ///
    /// Migrations run before the backend is handed to the service so every
    /// operation can assume `pluggable_metadata` and its helpers exist.
    pub async fn connect(config: StateStoreConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(&config.connection_string)
            .map_err(|err| StoreError::Config(format!("connection string: {err}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(classify_sqlx)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Unexpected(err.into()))?;

        // Trivial round-trip so Init fails loudly on a dead database.
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(classify_sqlx)?;

        let (janitor_shutdown, shutdown_rx) = watch::channel(false);
        let janitor_handle = config
            .cleanup_interval
            .map(|period| tokio::spawn(janitor::run(pool.clone(), period, shutdown_rx)));

        Ok(Self {
            pool,
            config,
            provisioner: Provisioner::new(),
            janitor_shutdown,
            janitor_handle: Mutex::new(janitor_handle),
        })
    }

    /// Provision the tenant's schema and table (and register the target for
    /// the janitor) before the first write. Memoized per process lifetime;
    /// `IF NOT EXISTS` covers other processes.
    async fn ensure_target(&self, target: &Target, tenant_id: &str) -> StoreResult<()> {
        self.provisioner
            .ensure(&target.schema_key(), || async {
                create_schema_if_absent(&self.pool, &target.schema).await
            })
            .await?;
        self.provisioner
            .ensure(&target.table_key(), || async {
                create_table_if_absent(&self.pool, target).await?;
                register_target(&self.pool, tenant_id, target).await
            })
            .await
    }
}

#[async_trait]
impl StateBackend for PostgresBackend {
    async fn get(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StoreResult<Option<StoredValue>> {
        let target = self.config.resolve_target(metadata)?;
        fetch(&self.pool, &target, key).await
    }

    async fn set(&self, op: SetOp) -> StoreResult<()> {
        let target = self.config.resolve_target(&op.metadata)?;
        let tenant_id = self.config.tenant_of(&op.metadata);
        self.ensure_target(&target, &tenant_id).await?;

        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;
        upsert(&mut tx, &target, &op).await?;
        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }

    async fn delete(&self, op: DeleteOp) -> StoreResult<()> {
        let target = self.config.resolve_target(&op.metadata)?;

        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;
        delete(&mut tx, &target, &op).await?;
        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }

    async fn transact(&self, ops: Vec<TransactOp>) -> StoreResult<()> {
        // Provision outside the transaction so DDL round-trips are not held
        // open inside it; the memo makes repeats free.
        let mut ensured: HashSet<Target> = HashSet::new();
        for op in &ops {
            if let TransactOp::Set(set) = op {
                let target = self.config.resolve_target(&set.metadata)?;
                if ensured.insert(target.clone()) {
                    let tenant_id = self.config.tenant_of(&set.metadata);
                    self.ensure_target(&target, &tenant_id).await?;
                }
            }
        }

        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;
        for op in ops {
            match op {
                TransactOp::Set(set) => {
                    let target = self.config.resolve_target(&set.metadata)?;
                    upsert(&mut tx, &target, &set).await?;
                }
                TransactOp::Delete(del) => {
                    let target = self.config.resolve_target(&del.metadata)?;
                    match delete(&mut tx, &target, &del).await {
                        // Absent table means absent row; the batch goes on.
                        Err(StoreError::TableMissing) => {}
                        other => other?,
                    }
                }
            }
        }
        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.janitor_shutdown.send(true);
        let handle = {
            let mut guard = self
                .janitor_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pool.close().await;
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn is_durable(&self) -> bool {
        true
    }
}

async fn create_schema_if_absent(pool: &PgPool, schema: &str) -> StoreResult<()> {
    let sql = format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        routing::quote_ident(schema)
    );
    sqlx::query(&sql).execute(pool).await.map_err(classify_sqlx)?;
    tracing::debug!(schema = %schema, "schema provisioned");
    Ok(())
}

async fn create_table_if_absent(pool: &PgPool, target: &Target) -> StoreResult<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
            key         text PRIMARY KEY, \
            value       jsonb NOT NULL, \
            etag        uuid NOT NULL, \
            inserted_at timestamptz NOT NULL DEFAULT now(), \
            updated_at  timestamptz, \
            expires_at  timestamptz\
        )",
        target.qualified()
    );
    sqlx::query(&sql).execute(pool).await.map_err(classify_sqlx)?;

    // Partial index keeps janitor sweeps cheap on tables where few rows
    // carry an expiry.
    let index = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (expires_at) WHERE expires_at IS NOT NULL",
        routing::quote_ident(&format!("{}_expires_at_idx", target.table)),
        target.qualified()
    );
    sqlx::query(&index)
        .execute(pool)
        .await
        .map_err(classify_sqlx)?;
    tracing::debug!(target = %target.qualified(), "table provisioned");
    Ok(())
}

/// Record the target in the janitor registry. Idempotent across processes.
async fn register_target(pool: &PgPool, tenant_id: &str, target: &Target) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO pluggable_metadata.tenant (tenant_id, schema_id, table_id) \
         VALUES ($1, $2, $3) ON CONFLICT (schema_id, table_id) DO NOTHING",
    )
    .bind(tenant_id)
    .bind(&target.schema)
    .bind(&target.table)
    .execute(pool)
    .await
    .map_err(classify_sqlx)?;
    Ok(())
}

async fn fetch<'e, E>(executor: E, target: &Target, key: &str) -> StoreResult<Option<StoredValue>>
where
    E: sqlx::PgExecutor<'e>,
{
    // Expired-but-unswept rows are invisible to readers; the janitor only
    // reclaims storage.
    let sql = format!(
        "SELECT value, etag FROM {} \
         WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        target.qualified()
    );
    let row = sqlx::query_as::<_, (Value, Uuid)>(&sql)
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(classify_sqlx)?;
    Ok(row.map(|(value, etag)| StoredValue { value, etag }))
}

async fn upsert(conn: &mut PgConnection, target: &Target, op: &SetOp) -> StoreResult<()> {
    let expected = op.etag.as_deref().map(parse_etag).transpose()?;
    let ttl = routing::ttl_from_metadata(&op.metadata)?;
    let expires_at: Option<DateTime<Utc>> = match ttl {
        Some(secs) if secs > 0 => Some(Utc::now() + ChronoDuration::seconds(secs)),
        _ => None,
    };
    let fresh = Uuid::new_v4();

    match expected {
        None => {
            let sql = format!(
                "INSERT INTO {} (key, value, etag, expires_at) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key) DO UPDATE SET \
                     value = EXCLUDED.value, \
                     etag = EXCLUDED.etag, \
                     expires_at = EXCLUDED.expires_at, \
                     updated_at = now()",
                target.qualified()
            );
            sqlx::query(&sql)
                .bind(&op.key)
                .bind(&op.value)
                .bind(fresh)
                .bind(expires_at)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx)?;
        }
        Some(expected) => {
            let sql = format!(
                "UPDATE {} SET value = $2, etag = $3, expires_at = $4, updated_at = now() \
                 WHERE key = $1 AND etag = $5",
                target.qualified()
            );
            let done = sqlx::query(&sql)
                .bind(&op.key)
                .bind(&op.value)
                .bind(fresh)
                .bind(expires_at)
                .bind(expected)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx)?;
            if done.rows_affected() == 0 {
                return Err(StoreError::EtagMismatch(op.key.clone()));
            }
        }
    }
    Ok(())
}

async fn delete(conn: &mut PgConnection, target: &Target, op: &DeleteOp) -> StoreResult<()> {
    let expected = op.etag.as_deref().map(parse_etag).transpose()?;

    // `to_regclass` yields NULL for an absent relation instead of raising,
    // so a delete against an unprovisioned tenant never poisons an open
    // transaction. CASE keeps the helper from being invoked on NULL.
    let removed: Option<bool> = match expected {
        None => {
            sqlx::query_scalar(
                "SELECT CASE WHEN to_regclass($1) IS NULL THEN NULL \
                        ELSE pluggable_metadata.delete_key_v1(to_regclass($1), $2) END",
            )
            .bind(target.qualified())
            .bind(&op.key)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify_sqlx)?
        }
        Some(expected) => {
            sqlx::query_scalar(
                "SELECT CASE WHEN to_regclass($1) IS NULL THEN NULL \
                        ELSE pluggable_metadata.delete_key_with_etag_v1(to_regclass($1), $2, $3) END",
            )
            .bind(target.qualified())
            .bind(&op.key)
            .bind(expected)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify_sqlx)?
        }
    };

    match removed {
        None => Err(StoreError::TableMissing),
        Some(false) if expected.is_some() => Err(StoreError::EtagMismatch(op.key.clone())),
        Some(_) => Ok(()),
    }
}

/// Map driver errors onto the classified taxonomy.
pub(crate) fn classify_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
            StoreError::TableMissing
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Transport(err.to_string()),
        _ => StoreError::Unexpected(anyhow!(err)),
    }
}
