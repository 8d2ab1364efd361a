//! gRPC implementation of the pluggable state-store contract.
//!
//! Translates between the wire protocol and a `StateBackend`: decodes
//! payloads (JSON documents only), threads per-operation metadata through to
//! the routing layer, and maps the classified store errors onto the status
//! codes the sidecar expects. `TableMissing` is the one error swallowed
//! here: an unprovisioned tenant has no data, so reads come back empty and
//! deletes are no-ops.

use crate::config::BackendKind;
use crate::proto;
use crate::proto::state_store_server::{StateStore, StateStoreServer};
use crate::routing::StateStoreConfig;
use crate::store::{
    DeleteOp, SetOp, StateBackend, StoreError, StoreResult, TransactOp,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::{Code, Request, Response, Status};
use tonic_types::{ErrorDetails, StatusExt};

/// Capabilities advertised to the sidecar.
const FEATURES: [&str; 2] = ["ETAG", "TRANSACTIONAL"];

struct Initialized {
    properties: HashMap<String, String>,
    backend: Arc<dyn StateBackend>,
}

struct Inner {
    kind: BackendKind,
    state: RwLock<Option<Initialized>>,
}

/// The component's gRPC service. Cloneable handle over shared state; one
/// instance serves all concurrent RPCs.
#[derive(Clone)]
pub struct StateService {
    inner: Arc<Inner>,
}

impl StateService {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                state: RwLock::new(None),
            }),
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> StateStoreServer<Self> {
        StateStoreServer::new(self)
    }

    /// Stop background work and release the backend's connections.
    pub async fn shutdown(&self) {
        let guard = self.inner.state.read().await;
        if let Some(init) = guard.as_ref() {
            init.backend.shutdown().await;
        }
    }

    async fn backend(&self) -> Result<Arc<dyn StateBackend>, Status> {
        let guard = self.inner.state.read().await;
        guard
            .as_ref()
            .map(|init| Arc::clone(&init.backend))
            .ok_or_else(|| Status::failed_precondition("state store is not initialized"))
    }

    async fn build_backend(
        &self,
        config: StateStoreConfig,
    ) -> StoreResult<Arc<dyn StateBackend>> {
        match self.inner.kind {
            BackendKind::Postgres => Ok(Arc::new(
                crate::store::postgres::PostgresBackend::connect(config).await?,
            )),
            BackendKind::Memory => Ok(Arc::new(crate::store::memory::InMemoryBackend::new(
                config,
            ))),
        }
    }
}

#[tonic::async_trait]
impl StateStore for StateService {
    async fn init(
        &self,
        request: Request<proto::InitRequest>,
    ) -> Result<Response<proto::InitResponse>, Status> {
        let properties = request.into_inner().properties;
        let config = StateStoreConfig::from_properties(&properties).map_err(status_from)?;

        let mut guard = self.inner.state.write().await;
        if let Some(existing) = guard.as_ref() {
            // The sidecar re-inits on restart with the same manifest; that
            // must be a no-op. Divergent properties are a manifest bug.
            if existing.properties == properties {
                return Ok(Response::new(proto::InitResponse {}));
            }
            return Err(Status::invalid_argument(
                "state store is already initialized with different properties",
            ));
        }

        let backend = self.build_backend(config.clone()).await.map_err(status_from)?;
        tracing::info!(
            backend = backend.backend_name(),
            durable = backend.is_durable(),
            tenancy = ?config.tenancy,
            "state store initialized"
        );
        *guard = Some(Initialized {
            properties,
            backend,
        });
        Ok(Response::new(proto::InitResponse {}))
    }

    async fn features(
        &self,
        _request: Request<proto::FeaturesRequest>,
    ) -> Result<Response<proto::FeaturesResponse>, Status> {
        Ok(Response::new(proto::FeaturesResponse {
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
        }))
    }

    async fn ping(
        &self,
        _request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingResponse>, Status> {
        let backend = self.backend().await?;
        backend.ping().await.map_err(status_from)?;
        Ok(Response::new(proto::PingResponse {}))
    }

    async fn get(
        &self,
        request: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetResponse>, Status> {
        let backend = self.backend().await?;
        let req = request.into_inner();

        match backend.get(&req.key, &req.metadata).await {
            Ok(Some(stored)) => {
                let value = serde_json::to_vec(&stored.value)
                    .map_err(|err| Status::internal(format!("encode value: {err}")))?;
                Ok(Response::new(proto::GetResponse {
                    value,
                    etag: Some(proto::Etag {
                        value: stored.etag.to_string(),
                    }),
                }))
            }
            // No row, or the tenant's table was never provisioned.
            Ok(None) | Err(StoreError::TableMissing) => {
                Ok(Response::new(proto::GetResponse {
                    value: Vec::new(),
                    etag: None,
                }))
            }
            Err(err) => Err(status_from(err)),
        }
    }

    async fn set(
        &self,
        request: Request<proto::SetRequest>,
    ) -> Result<Response<proto::SetResponse>, Status> {
        let backend = self.backend().await?;
        let op = decode_set(request.into_inner()).map_err(status_from)?;
        backend.set(op).await.map_err(status_from)?;
        Ok(Response::new(proto::SetResponse {}))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let backend = self.backend().await?;
        let req = request.into_inner();
        let op = DeleteOp {
            key: req.key,
            etag: etag_of(req.etag),
            metadata: req.metadata,
        };
        match backend.delete(op).await {
            Ok(()) | Err(StoreError::TableMissing) => {
                Ok(Response::new(proto::DeleteResponse {}))
            }
            Err(err) => Err(status_from(err)),
        }
    }

    async fn bulk_transact(
        &self,
        request: Request<proto::BulkTransactRequest>,
    ) -> Result<Response<proto::BulkTransactResponse>, Status> {
        let backend = self.backend().await?;
        let mut ops = Vec::new();
        for operation in request.into_inner().operations {
            let op = match operation.op {
                Some(proto::transact_operation::Op::Set(set)) => {
                    TransactOp::Set(decode_set(set).map_err(status_from)?)
                }
                Some(proto::transact_operation::Op::Delete(del)) => {
                    TransactOp::Delete(DeleteOp {
                        key: del.key,
                        etag: etag_of(del.etag),
                        metadata: del.metadata,
                    })
                }
                None => {
                    return Err(Status::invalid_argument(
                        "transact operation must be a set or a delete",
                    ));
                }
            };
            ops.push(op);
        }
        backend.transact(ops).await.map_err(status_from)?;
        Ok(Response::new(proto::BulkTransactResponse {}))
    }
}

/// Decode a wire set request, rejecting non-JSON payloads before any SQL.
fn decode_set(req: proto::SetRequest) -> StoreResult<SetOp> {
    if req.is_binary {
        return Err(StoreError::ValueNotJson);
    }
    let value: Value =
        serde_json::from_slice(&req.value).map_err(|_| StoreError::ValueNotJson)?;
    Ok(SetOp {
        key: req.key,
        value,
        etag: etag_of(req.etag),
        metadata: req.metadata,
    })
}

/// An absent or empty etag message means "unconditional".
fn etag_of(etag: Option<proto::Etag>) -> Option<String> {
    etag.map(|e| e.value).filter(|v| !v.is_empty())
}

/// Translate classified store errors into the statuses the sidecar expects.
fn status_from(err: StoreError) -> Status {
    match err {
        StoreError::Config(msg) => Status::invalid_argument(msg),
        StoreError::MissingTenant => {
            let mut details = ErrorDetails::new();
            details.add_bad_request_violation(
                "metadata.tenantId",
                "a tenant id is required by the configured tenancy mode",
            );
            Status::with_error_details(
                Code::FailedPrecondition,
                "missing tenant id in operation metadata",
                details,
            )
        }
        StoreError::EtagInvalid(raw) => {
            let mut details = ErrorDetails::new();
            details.add_precondition_failure_violation(
                "ETAG_INVALID",
                "etag",
                format!("{raw:?} is not a valid row version token"),
            );
            Status::with_error_details(Code::FailedPrecondition, "invalid etag", details)
        }
        StoreError::EtagMismatch(key) => {
            let mut details = ErrorDetails::new();
            details.add_precondition_failure_violation(
                "ETAG_MISMATCH",
                key,
                "the stored row version does not match the supplied etag",
            );
            Status::with_error_details(Code::FailedPrecondition, "etag mismatch", details)
        }
        // Converted to empty/no-op before mapping; reaching here is a bug.
        StoreError::TableMissing => Status::internal("unhandled missing target table"),
        StoreError::ValueNotJson => Status::invalid_argument(
            "value must be a JSON document; binary payloads are not supported",
        ),
        StoreError::Transport(msg) => Status::unavailable(msg),
        StoreError::Unexpected(err) => {
            tracing::error!(error = ?err, "internal state store error");
            Status::internal(err.to_string())
        }
    }
}
