//! burrow-statestore — tenant-isolating PostgreSQL state store component.
//!
//! # Purpose
//! Implements the sidecar's pluggable state-store contract over a Unix
//! domain socket. Every operation carries an opaque `tenantId` in its
//! metadata; the component routes it to a tenant-specific schema or table in
//! a shared database so tenants never observe each other's data, even when
//! keys collide.
//!
//! # Architecture
//! `routing` derives the physical `(schema, table)` target per operation;
//! `provisioner` gates lazy DDL so cold starts issue one `CREATE` per
//! resource; `store` holds the classified error taxonomy and the backends
//! (durable Postgres, in-memory for dev/test); `janitor` reclaims TTL'd
//! rows; `service` is the gRPC surface and `config`/`main` wire the host.

pub mod config;
pub mod janitor;
pub mod provisioner;
pub mod routing;
pub mod service;
pub mod store;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("statestore.v1");
}
