//! Host configuration sourced from environment variables.
//!
//! Component configuration (connection string, tenancy, defaults) arrives
//! later through the `Init` RPC; this module only covers what the process
//! needs before the sidecar connects: where to put the socket and which
//! backend to build at `Init`.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

const DEFAULT_SOCKETS_FOLDER: &str = "/tmp/burrow-components-sockets";
const DEFAULT_COMPONENT_NAME: &str = "burrow-statestore";

/// Which `StateBackend` `Init` constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Durable Postgres backend (production default).
    Postgres,
    /// Non-durable in-memory backend for local development.
    Memory,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory the sidecar watches for component sockets.
    pub sockets_folder: PathBuf,
    /// Component name; the socket file is `<name>.sock`.
    pub component_name: String,
    pub backend: BackendKind,
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        let sockets_folder = std::env::var("BURROW_SOCKETS_FOLDER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKETS_FOLDER));

        let component_name = std::env::var("BURROW_COMPONENT_NAME")
            .unwrap_or_else(|_| DEFAULT_COMPONENT_NAME.to_string());
        if component_name.is_empty() || component_name.contains(std::path::MAIN_SEPARATOR) {
            bail!("BURROW_COMPONENT_NAME must be a bare file name, got {component_name:?}");
        }

        let backend = match std::env::var("BURROW_BACKEND").as_deref() {
            Err(_) | Ok("postgres") => BackendKind::Postgres,
            Ok("memory") => BackendKind::Memory,
            Ok(other) => bail!("BURROW_BACKEND must be \"postgres\" or \"memory\", got {other:?}"),
        };

        Ok(Self {
            sockets_folder,
            component_name,
            backend,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.sockets_folder
            .join(format!("{}.sock", self.component_name))
    }

    pub fn sockets_folder(&self) -> &Path {
        &self.sockets_folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_burrow_env() {
        for (key, _) in env::vars() {
            if key.starts_with("BURROW_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_burrow_env();
        let config = HostConfig::from_env().expect("from_env");
        assert_eq!(
            config.sockets_folder,
            PathBuf::from("/tmp/burrow-components-sockets")
        );
        assert_eq!(config.component_name, "burrow-statestore");
        assert_eq!(config.backend, BackendKind::Postgres);
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/tmp/burrow-components-sockets/burrow-statestore.sock")
        );
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_burrow_env();
        unsafe {
            env::set_var("BURROW_SOCKETS_FOLDER", "/run/components");
            env::set_var("BURROW_COMPONENT_NAME", "tenants-state");
            env::set_var("BURROW_BACKEND", "memory");
        }

        let config = HostConfig::from_env().expect("from_env");
        assert_eq!(config.socket_path(), PathBuf::from("/run/components/tenants-state.sock"));
        assert_eq!(config.backend, BackendKind::Memory);

        clear_burrow_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_unknown_backend() {
        clear_burrow_env();
        unsafe {
            env::set_var("BURROW_BACKEND", "sqlite");
        }
        assert!(HostConfig::from_env().is_err());
        clear_burrow_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_component_name_with_separators() {
        clear_burrow_env();
        unsafe {
            env::set_var("BURROW_COMPONENT_NAME", "nested/name");
        }
        assert!(HostConfig::from_env().is_err());
        clear_burrow_env();
    }
}
