//! `PylonConfig` — CLI/env/TOML-file layered configuration.
//!
//! Priority (highest to lowest): CLI flag / env var > `{data_dir}/config.toml`
//! > built-in default. Mirrors the teacher daemon's `DaemonConfig::new`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_BEACON_PORT: u16 = 9875;
const DEFAULT_MCP_PORT: u16 = 9880;
const DEFAULT_RELAY_URL: &str = "wss://relay.estelle.example/ws";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Release stage decoded from `PYLON_ENV_CONFIG` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Release,
    Stage,
    Dev,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Release => "release",
            Environment::Stage => "stage",
            Environment::Dev => "dev",
        }
    }

    fn from_env_id(id: u8) -> Self {
        match id {
            0 => Environment::Release,
            1 => Environment::Stage,
            _ => Environment::Dev,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnvConfigPayload {
    #[serde(rename = "envId")]
    env_id: u8,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    beacon_port: Option<u16>,
    mcp_port: Option<u16>,
    relay_url: Option<String>,
    log: Option<String>,
    request_timeout_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct PylonConfig {
    pub pylon_id: u32,
    pub data_dir: PathBuf,
    pub beacon_port: u16,
    pub mcp_port: u16,
    pub relay_url: String,
    pub log: String,
    pub request_timeout_secs: u64,
    pub environment: Environment,
    pub version: String,
}

impl PylonConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pylon_id: u32,
        data_dir: Option<PathBuf>,
        beacon_port: Option<u16>,
        mcp_port: Option<u16>,
        relay_url: Option<String>,
        log: Option<String>,
        request_timeout_secs: Option<u64>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            pylon_id,
            beacon_port: beacon_port.or(toml.beacon_port).unwrap_or(DEFAULT_BEACON_PORT),
            mcp_port: mcp_port.or(toml.mcp_port).unwrap_or(DEFAULT_MCP_PORT),
            relay_url: relay_url
                .or(toml.relay_url)
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            request_timeout_secs: request_timeout_secs
                .or(toml.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            environment: read_environment(),
            version: std::env::var("PYLON_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            data_dir,
        }
    }
}

/// Parse `PYLON_ENV_CONFIG={"envId":0|1|2}` into an [`Environment`].
/// Defaults to `Dev` when unset or malformed.
fn read_environment() -> Environment {
    std::env::var("PYLON_ENV_CONFIG")
        .ok()
        .and_then(|raw| serde_json::from_str::<EnvConfigPayload>(&raw).ok())
        .map(|payload| Environment::from_env_id(payload.env_id))
        .unwrap_or(Environment::Dev)
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("pylon");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("pylon");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("pylon");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("pylon");
        }
    }
    PathBuf::from(".pylon")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_config_parses_known_ids() {
        std::env::set_var("PYLON_ENV_CONFIG", r#"{"envId":0}"#);
        assert_eq!(read_environment(), Environment::Release);
        std::env::set_var("PYLON_ENV_CONFIG", r#"{"envId":1}"#);
        assert_eq!(read_environment(), Environment::Stage);
        std::env::set_var("PYLON_ENV_CONFIG", r#"{"envId":2}"#);
        assert_eq!(read_environment(), Environment::Dev);
        std::env::remove_var("PYLON_ENV_CONFIG");
    }

    #[test]
    fn env_config_defaults_to_dev_when_unset() {
        std::env::remove_var("PYLON_ENV_CONFIG");
        assert_eq!(read_environment(), Environment::Dev);
    }
}
