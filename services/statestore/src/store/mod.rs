//! Storage backends for the state-store component.
//!
//! # Purpose
//! Defines the classified error taxonomy, the operation types carried from
//! the gRPC surface down to a backend, and the `StateBackend` trait the
//! service layer consumes. Two implementations exist:
//! - `postgres`: the durable production backend (per-tenant schemas/tables)
//! - `memory`: a non-durable backend for local development and tests
//!
//! # Error model
//! `EtagMismatch` and `EtagInvalid` are classified results, not panics: the
//! adapter returns them as variants and the gRPC layer translates them into
//! the status codes the sidecar expects. `TableMissing` is surfaced distinctly
//! so the service boundary can treat an unprovisioned tenant as "no data".

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing or unrecognized component configuration. Fails `Init`.
    #[error("configuration: {0}")]
    Config(String),
    /// Tenancy is configured but the operation carried no tenant id.
    #[error("tenant id required but missing from operation metadata")]
    MissingTenant,
    /// The supplied etag is not parseable as a row version token.
    #[error("invalid etag {0:?}")]
    EtagInvalid(String),
    /// A conditional write or delete matched zero rows.
    #[error("etag mismatch for key {0:?}")]
    EtagMismatch(String),
    /// The target table does not exist. Converted to "no row" / no-op on
    /// read and delete paths at the service boundary.
    #[error("target table does not exist")]
    TableMissing,
    /// The payload is not a JSON document (or was flagged as binary).
    #[error("value is not a JSON document")]
    ValueNotJson,
    /// Connection-level failure: pool exhaustion, broken socket, TLS.
    #[error("database unavailable: {0}")]
    Transport(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored JSON document together with its current row version.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Value,
    pub etag: Uuid,
}

/// A single set operation as received from the wire, metadata included.
#[derive(Debug, Clone)]
pub struct SetOp {
    pub key: String,
    pub value: Value,
    /// Conditional-write token; `None` means insert-or-update.
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A single delete operation as received from the wire.
#[derive(Debug, Clone)]
pub struct DeleteOp {
    pub key: String,
    /// Conditional-delete token; `None` means unconditional.
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One element of a `BulkTransact` batch. Each element resolves its own
/// routing target, so a batch may span tenants.
#[derive(Debug, Clone)]
pub enum TransactOp {
    Set(SetOp),
    Delete(DeleteOp),
}

/// Parse a wire etag into the stored representation.
///
/// Parsing happens before any SQL is sent so a malformed token is classified
/// as `EtagInvalid` rather than surfacing as a bind error.
pub fn parse_etag(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StoreError::EtagInvalid(raw.to_string()))
}

/// Backend surface consumed by the gRPC service.
///
/// Implementations are shared across concurrent request handlers; every
/// method is stateless end-to-end apart from the backend's own pooling and
/// provisioning memo.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Fetch the value and etag for a key, or `None` when no live row exists.
    async fn get(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StoreResult<Option<StoredValue>>;

    /// Insert or update a key, provisioning the tenant target on first write.
    async fn set(&self, op: SetOp) -> StoreResult<()>;

    /// Delete a key, optionally conditional on its etag.
    async fn delete(&self, op: DeleteOp) -> StoreResult<()>;

    /// Execute a batch of operations atomically: all commit or none do.
    async fn transact(&self, ops: Vec<TransactOp>) -> StoreResult<()>;

    /// Connectivity probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Stop background work and release connections. Idempotent.
    async fn shutdown(&self);

    fn backend_name(&self) -> &'static str;
    fn is_durable(&self) -> bool;
}
