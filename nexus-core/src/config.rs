//! Server configuration loaded from `config.toml` in the config directory,
//! following the teacher's split between a persisted TOML shape and an
//! application-facing struct with resolved defaults.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::token_store::DEFAULT_PORT;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Option<HashMap<String, String>>,

    /// Names of host environment variables to forward to the subprocess in
    /// addition to the fixed allow-list (`PATH`, `HOME`, `USER`, `LANG`,
    /// `LC_ALL`, ...). Never used to forward secrets implicitly; entries
    /// matching `*_API_KEY`/`*_TOKEN`/`*_SECRET*` are dropped even if listed
    /// here.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

/// On-disk shape of `config.toml`. Every field is optional so an empty or
/// absent file is valid and falls back to [`Config::default_for`].
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    #[serde(default = "default_host")]
    host: Option<String>,

    #[serde(default)]
    port: Option<u16>,

    #[serde(default)]
    strict_token_permissions: Option<bool>,

    #[serde(default)]
    presets: HashMap<String, String>,

    #[serde(default)]
    mcp_servers: HashMap<String, McpServerConfig>,
}

/// Application-facing configuration with all defaults resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub config_dir: PathBuf,
    pub strict_token_permissions: bool,
    pub custom_presets: HashMap<String, String>,
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Config {
    pub fn default_for(config_dir: PathBuf) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            config_dir,
            strict_token_permissions: true,
            custom_presets: HashMap::new(),
            mcp_servers: HashMap::new(),
        }
    }

    /// Load `config.toml` from `config_dir`. A missing file yields
    /// [`Config::default_for`]; a present-but-malformed file is an error.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join("config.toml");
        if !path.exists() {
            return Ok(Self::default_for(config_dir.to_path_buf()));
        }

        let raw = std::fs::read_to_string(&path)?;
        let parsed: ConfigToml = toml::from_str(&raw)?;

        Ok(Self {
            host: parsed.host.unwrap_or_else(default_host),
            port: parsed.port.unwrap_or_else(default_port),
            config_dir: config_dir.to_path_buf(),
            strict_token_permissions: parsed.strict_token_permissions.unwrap_or(true),
            custom_presets: parsed.presets,
            mcp_servers: parsed.mcp_servers,
        })
    }

    /// Default config directory, mirroring the discovery order used by
    /// token lookup: `$NEXUS3_CONFIG_DIR`, else `~/.nexus3`.
    pub fn default_config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("NEXUS3_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nexus3")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.strict_token_permissions);
    }

    #[test]
    fn parses_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            host = "0.0.0.0"
            port = 9000
            strict_token_permissions = false

            [presets.reviewer]
            base = "sandboxed"

            [mcp_servers.fs]
            command = "mcp-fs"
            args = ["--root", "/tmp"]
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(!config.strict_token_permissions);
        assert_eq!(config.mcp_servers["fs"].command, "mcp-fs");
    }
}
