//! Backend connection options resolved from the environment.
//!
//! The embedded engine does not open network connections; this module only
//! produces the opaque options value a [`crate::client::Client`] is built with,
//! validating TLS material up front so misconfiguration surfaces at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::config::TASK_QUEUE_NAME;
use crate::core::errors::{FlowError, Result};

pub const DEFAULT_TARGET: &str = "localhost:7233";
pub const DEFAULT_NAMESPACE: &str = "default";

pub const ENV_TARGET: &str = "TXFLOW_CONNECTION_TARGET";
pub const ENV_NAMESPACE: &str = "TXFLOW_CONNECTION_NAMESPACE";
pub const ENV_CERT_CHAIN: &str = "TXFLOW_CONNECTION_MTLS_CERT_CHAIN_FILE";
pub const ENV_KEY: &str = "TXFLOW_CONNECTION_MTLS_KEY_FILE";
pub const ENV_ROOT_CA: &str = "TXFLOW_SERVER_ROOT_CA_CERT";
pub const ENV_SERVER_NAME: &str = "TXFLOW_SERVER_NAME";
pub const ENV_INSECURE_SKIP_VERIFY: &str = "TXFLOW_INSECURE_SKIP_VERIFY";
pub const ENV_TASK_QUEUE: &str = "TXFLOW_TASK_QUEUE";

/// Mutual-TLS material for a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub root_ca: Option<PathBuf>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub target: String,
    pub namespace: String,
    pub task_queue: String,
    pub tls: Option<TlsOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            task_queue: TASK_QUEUE_NAME.to_string(),
            tls: None,
        }
    }
}

impl ConnectionOptions {
    /// Resolve options from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve options through an arbitrary variable source.
    ///
    /// An unset target falls back to the local default with the `default`
    /// namespace and no TLS. Any target other than the local default requires
    /// a client certificate chain and key; both are read and checked for PEM
    /// framing, as is the optional root CA.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let task_queue = get(ENV_TASK_QUEUE).unwrap_or_else(|| TASK_QUEUE_NAME.to_string());

        let target = match get(ENV_TARGET) {
            None => {
                return Ok(Self {
                    task_queue,
                    ..Self::default()
                })
            }
            Some(target) => target,
        };
        let namespace = get(ENV_NAMESPACE).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        if target == DEFAULT_TARGET {
            return Ok(Self {
                target,
                namespace,
                task_queue,
                tls: None,
            });
        }

        let client_cert = get(ENV_CERT_CHAIN)
            .map(PathBuf::from)
            .ok_or_else(|| {
                FlowError::configuration_field(
                    "client certificate chain is required for a remote target",
                    ENV_CERT_CHAIN,
                )
            })?;
        let client_key = get(ENV_KEY)
            .map(PathBuf::from)
            .ok_or_else(|| {
                FlowError::configuration_field(
                    "client key is required for a remote target",
                    ENV_KEY,
                )
            })?;
        let root_ca = get(ENV_ROOT_CA).map(PathBuf::from);
        let insecure_skip_verify = match get(ENV_INSECURE_SKIP_VERIFY) {
            None => false,
            Some(raw) => raw.trim().parse::<bool>().map_err(|_| {
                FlowError::configuration_field(
                    format!("expected true or false, got '{raw}'"),
                    ENV_INSECURE_SKIP_VERIFY,
                )
            })?,
        };

        check_pem(&client_cert, "CERTIFICATE", ENV_CERT_CHAIN)?;
        check_pem(&client_key, "PRIVATE KEY", ENV_KEY)?;
        if let Some(ca) = &root_ca {
            check_pem(ca, "CERTIFICATE", ENV_ROOT_CA)?;
        }

        Ok(Self {
            target,
            namespace,
            task_queue,
            tls: Some(TlsOptions {
                client_cert,
                client_key,
                root_ca,
                server_name: get(ENV_SERVER_NAME),
                insecure_skip_verify,
            }),
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Human-readable summary of the resolved connection, for status output.
    pub fn server_info(&self) -> BTreeMap<&'static str, String> {
        let mut info = BTreeMap::new();
        info.insert("address", self.target.clone());
        info.insert("namespace", self.namespace.clone());
        info.insert("taskQueue", self.task_queue.clone());
        let (cert, key) = match &self.tls {
            Some(tls) => (
                tls.client_cert.display().to_string(),
                tls.client_key.display().to_string(),
            ),
            None => (String::new(), String::new()),
        };
        info.insert("certPath", cert);
        info.insert("keyPath", key);
        info
    }
}

/// Read a PEM file and confirm it contains at least one block of `label`.
/// Key labels match any `... PRIVATE KEY` variant.
fn check_pem(path: &Path, label: &str, field: &str) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| FlowError::io(format!("reading {}", path.display()), e))?;
    let has_block = contents
        .lines()
        .any(|line| line.starts_with("-----BEGIN ") && line.contains(label));
    if !has_block {
        return Err(FlowError::configuration_field(
            format!("{} is not a valid PEM file ({label})", path.display()),
            field,
        ));
    }
    Ok(())
}
