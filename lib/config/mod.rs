use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::command_processor::CommandSpec;

pub const DEFAULT_SOURCE_URL: &str = "https://api.unsplash.com";
pub const DEFAULT_NAMESPACE: &str = "harvest";
pub const DEFAULT_STATE_DIR: &str = ".harvest_state";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Infrastructure settings read from the environment (after `.env` is loaded).
///
/// Tuning knobs live on the CLI; this is only where things are and who we are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    /// Root of the shared lease store. Required.
    pub store_root: PathBuf,
    /// Local directory for queue logs, progress snapshots and failure logs.
    pub state_dir: PathBuf,
    /// Key prefix inside the shared store; clients coordinate only within one namespace.
    pub namespace: String,
    /// `HARVEST_OWNER_ID`, when set. Otherwise each scan pins `host_owner_id` on first run.
    pub owner_id: Option<String>,
    pub host_owner_id: String,
    pub source_url: String,
    pub source_token: Option<String>,
    pub processor_cmd: Option<CommandSpec>,
    pub metrics_bind: Option<SocketAddr>,
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_root = get("HARVEST_STORE_ROOT")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("HARVEST_STORE_ROOT"))?;
        let state_dir = get("HARVEST_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));

        let namespace = get("HARVEST_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.starts_with('/') || namespace.ends_with('/') || namespace.contains("..") {
            return Err(ConfigError::Invalid {
                key: "HARVEST_NAMESPACE",
                message: format!("`{namespace}` must be a relative key prefix"),
            });
        }

        let owner_id = get("HARVEST_OWNER_ID");
        let host_owner_id = default_owner_id(&get);
        let source_url = get("HARVEST_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        let source_token = get("HARVEST_SOURCE_TOKEN");

        let processor_cmd = get("HARVEST_PROCESSOR_CMD")
            .map(|raw| CommandSpec::parse(&raw))
            .transpose()
            .map_err(|message| ConfigError::Invalid {
                key: "HARVEST_PROCESSOR_CMD",
                message,
            })?;
        let metrics_bind = get("HARVEST_METRICS_BIND")
            .map(|raw| {
                raw.parse::<SocketAddr>().map_err(|err| ConfigError::Invalid {
                    key: "HARVEST_METRICS_BIND",
                    message: format!("`{raw}`: {err}"),
                })
            })
            .transpose()?;

        Ok(Self {
            store_root,
            state_dir,
            namespace,
            owner_id,
            host_owner_id,
            source_url,
            source_token,
            processor_cmd,
            metrics_bind,
        })
    }
}

/// `{host}-{pid}`, so two workers on one machine never share an owner id.
fn default_owner_id(get: &impl Fn(&str) -> Option<String>) -> String {
    let host = get("HOSTNAME").unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}
