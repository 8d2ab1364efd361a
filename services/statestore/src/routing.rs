//! Component configuration and tenant routing.
//!
//! # Purpose
//! Parses the `Init` property map into a typed configuration and resolves,
//! per operation, the concrete `(schema, table)` target from the configured
//! tenancy mode plus the operation's metadata.
//!
//! # Isolation
//! Distinct tenant ids always produce targets that differ in schema or table,
//! so a key written under one tenant can never be read under another. The
//! derivation is total: it either yields a target or a classified error.

use crate::store::{StoreError, StoreResult};
use std::collections::HashMap;
use std::time::Duration;

/// Metadata key selecting the tenant namespace.
pub const METADATA_TENANT_ID: &str = "tenantId";
/// Metadata key carrying row expiry in seconds (set operations only).
pub const METADATA_TTL: &str = "ttlInSeconds";

pub const PROPERTY_CONNECTION_STRING: &str = "connectionString";
pub const PROPERTY_TENANT: &str = "tenant";
pub const PROPERTY_SCHEMA: &str = "schema";
pub const PROPERTY_TABLE: &str = "table";
pub const PROPERTY_CLEANUP_INTERVAL: &str = "cleanupIntervalInSeconds";

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_TABLE: &str = "state";
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 5;

/// How tenant ids rewrite the routing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenancyMode {
    /// No rewriting; all operations share the default target.
    None,
    /// The tenant id prefixes the schema name.
    Schema,
    /// The tenant id prefixes the table name.
    Table,
}

/// Parsed component configuration from `Init.properties`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateStoreConfig {
    pub connection_string: String,
    pub tenancy: TenancyMode,
    pub schema: String,
    pub table: String,
    /// Janitor period; `None` disables TTL sweeps.
    pub cleanup_interval: Option<Duration>,
}

/// A concrete physical location for state rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub schema: String,
    pub table: String,
}

impl Target {
    /// Fully qualified, quoted identifier pair for SQL emission.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Provisioner memo key for the schema resource.
    pub fn schema_key(&self) -> String {
        format!("S:{}", self.schema)
    }

    /// Provisioner memo key for the table resource.
    pub fn table_key(&self) -> String {
        format!("T:{}.{}", self.schema, self.table)
    }
}

/// Double-quote an identifier, doubling embedded quotes, so tenant-derived
/// names cannot alter statement structure.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl StateStoreConfig {
    pub fn from_properties(properties: &HashMap<String, String>) -> StoreResult<Self> {
        let connection_string = properties
            .get(PROPERTY_CONNECTION_STRING)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                StoreError::Config(format!("missing required property {PROPERTY_CONNECTION_STRING:?}"))
            })?
            .clone();

        let tenancy = match properties.get(PROPERTY_TENANT).map(String::as_str) {
            None | Some("") => TenancyMode::None,
            Some("schema") => TenancyMode::Schema,
            Some("table") => TenancyMode::Table,
            Some(other) => {
                return Err(StoreError::Config(format!(
                    "unrecognized {PROPERTY_TENANT:?} value {other:?} (expected \"schema\" or \"table\")"
                )));
            }
        };

        let schema = properties
            .get(PROPERTY_SCHEMA)
            .filter(|v| !v.is_empty())
            .map_or(DEFAULT_SCHEMA, String::as_str)
            .to_string();
        let table = properties
            .get(PROPERTY_TABLE)
            .filter(|v| !v.is_empty())
            .map_or(DEFAULT_TABLE, String::as_str)
            .to_string();

        let cleanup_interval = match properties.get(PROPERTY_CLEANUP_INTERVAL) {
            None => Some(Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS)),
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    StoreError::Config(format!(
                        "{PROPERTY_CLEANUP_INTERVAL:?} must be a non-negative integer, got {raw:?}"
                    ))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        Ok(Self {
            connection_string,
            tenancy,
            schema,
            table,
            cleanup_interval,
        })
    }

    /// Derive the routing target for one operation.
    pub fn resolve_target(&self, metadata: &HashMap<String, String>) -> StoreResult<Target> {
        match self.tenancy {
            TenancyMode::None => Ok(Target {
                schema: self.schema.clone(),
                table: self.table.clone(),
            }),
            TenancyMode::Schema => {
                let tenant = self.require_tenant(metadata)?;
                Ok(Target {
                    schema: format!("{tenant}-{}", self.schema),
                    table: self.table.clone(),
                })
            }
            TenancyMode::Table => {
                let tenant = self.require_tenant(metadata)?;
                Ok(Target {
                    schema: self.schema.clone(),
                    table: format!("{tenant}-{}", self.table),
                })
            }
        }
    }

    /// Tenant id for registry bookkeeping; empty when tenancy is off.
    pub fn tenant_of(&self, metadata: &HashMap<String, String>) -> String {
        if self.tenancy == TenancyMode::None {
            return String::new();
        }
        metadata
            .get(METADATA_TENANT_ID)
            .cloned()
            .unwrap_or_default()
    }

    fn require_tenant<'a>(&self, metadata: &'a HashMap<String, String>) -> StoreResult<&'a str> {
        metadata
            .get(METADATA_TENANT_ID)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or(StoreError::MissingTenant)
    }
}

/// Parse the optional `ttlInSeconds` metadata entry.
///
/// `0` clears any existing expiry; values must be non-negative integers.
pub fn ttl_from_metadata(metadata: &HashMap<String, String>) -> StoreResult<Option<i64>> {
    let Some(raw) = metadata.get(METADATA_TTL) else {
        return Ok(None);
    };
    let ttl: i64 = raw.parse().map_err(|_| {
        StoreError::Config(format!("{METADATA_TTL:?} must be an integer, got {raw:?}"))
    })?;
    if ttl < 0 {
        return Err(StoreError::Config(format!(
            "{METADATA_TTL:?} must be non-negative, got {ttl}"
        )));
    }
    Ok(Some(ttl))
}
