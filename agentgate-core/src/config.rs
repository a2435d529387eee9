//! Configuration: the `client_config.json` document plus `AGENTGATE_*`
//! environment overrides.
//!
//! The file maps server names to launch specs under `mcpServers`; a sibling
//! `_disabled_servers` map uses the same shape for servers staged while
//! waiting on credentials — they are listed but never spawned.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::GatewayError;

/// Conventional location of the config document, relative to the workspace
/// root.
pub const DEFAULT_CONFIG_PATH: &str = "mcp_gateway/client_config.json";

/// Launch spec for one tool server. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub startup_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("data/agent_logs"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    #[serde(default, rename = "_disabled_servers")]
    pub disabled_servers: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub ollama: OllamaSettings,
    #[serde(default)]
    pub limits: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

impl GatewayConfig {
    /// Load, validate and apply environment overrides. Bad JSON, a missing
    /// file or an invalid enabled-server name are fatal at startup.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            GatewayError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let mut config = Self::parse(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_json::from_str(raw)
            .map_err(|err| GatewayError::Configuration(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        for name in self.mcp_servers.keys() {
            if !is_valid_server_name(name) {
                return Err(GatewayError::Configuration(format!(
                    "invalid server name '{name}': must match ^[a-zA-Z0-9_-]+$"
                )));
            }
        }
        Ok(())
    }

    /// Apply `AGENTGATE_<SECTION>_<KEY>` overrides from the given lookup.
    /// Split out from [`load`](Self::load) so tests can drive it without
    /// touching process environment.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("AGENTGATE_OLLAMA_BASE_URL") {
            self.ollama.base_url = value;
        }
        if let Some(value) = get("AGENTGATE_OLLAMA_MODEL") {
            self.ollama.model = value;
        }
        if let Some(value) = get("AGENTGATE_RATELIMIT_ENABLED") {
            self.limits.enabled = parse_bool(&value);
        }
        if let Some(value) = get("AGENTGATE_RATELIMIT_PER_MINUTE") {
            if let Ok(per_minute) = value.parse() {
                self.limits.per_minute = per_minute;
            }
        }
        if let Some(value) = get("AGENTGATE_RATELIMIT_BURST") {
            if let Ok(burst) = value.parse() {
                self.limits.burst = burst;
            }
        }
        if let Some(value) = get("AGENTGATE_CACHE_ENABLED") {
            self.cache.enabled = parse_bool(&value);
        }
        if let Some(value) = get("AGENTGATE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = get("AGENTGATE_LOG_DIR") {
            self.logging.dir = PathBuf::from(value);
        }
        if let Some(value) = get("AGENTGATE_WORKSPACE_ROOT") {
            self.workspace_root = Some(PathBuf::from(value));
        }
    }
}

pub(crate) fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"{
        "mcpServers": {
            "filesystem": {
                "command": "npx",
                "args": ["-y", "@modelcontextprotocol/server-filesystem", "/home"],
                "description": "Access to filesystem operations"
            },
            "memory": {"command": "uvx", "args": ["mcp-server-memory"]}
        },
        "_disabled_servers": {
            "github": {
                "command": "npx",
                "args": ["-y", "@modelcontextprotocol/server-github"],
                "env": {"GITHUB_PERSONAL_ACCESS_TOKEN": "your_token_here"},
                "description": "GitHub API access (requires token in env)"
            }
        },
        "limits": {"per_minute": 120}
    }"#;

    #[test]
    fn parses_servers_and_staged_servers() {
        let config = GatewayConfig::parse(SAMPLE).expect("parse");
        assert_eq!(config.mcp_servers.len(), 2);
        assert_eq!(config.disabled_servers.len(), 1);
        let fs = &config.mcp_servers["filesystem"];
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args.len(), 3);
        assert_eq!(config.limits.per_minute, 120);
        assert!(config.limits.enabled);
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
    }

    #[test]
    fn rejects_invalid_server_names() {
        let raw = r#"{"mcpServers": {"bad name!": {"command": "true"}}}"#;
        let err = GatewayConfig::parse(raw).expect_err("must reject");
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = GatewayConfig::parse("{not json").expect_err("must reject");
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = GatewayConfig::parse(SAMPLE).expect("parse");
        let overrides: HashMap<&str, &str> = HashMap::from([
            ("AGENTGATE_OLLAMA_BASE_URL", "http://10.0.0.2:11434"),
            ("AGENTGATE_RATELIMIT_PER_MINUTE", "30"),
            ("AGENTGATE_RATELIMIT_ENABLED", "false"),
            ("AGENTGATE_CACHE_ENABLED", "0"),
            ("AGENTGATE_LOG_DIR", "/tmp/agentgate-logs"),
        ]);
        config.apply_overrides(|key| overrides.get(key).map(|v| v.to_string()));
        assert_eq!(config.ollama.base_url, "http://10.0.0.2:11434");
        assert_eq!(config.limits.per_minute, 30);
        assert!(!config.limits.enabled);
        assert!(!config.cache.enabled);
        assert_eq!(config.logging.dir, PathBuf::from("/tmp/agentgate-logs"));
    }

    #[test]
    fn unparseable_numeric_override_is_ignored() {
        let mut config = GatewayConfig::parse(SAMPLE).expect("parse");
        config.apply_overrides(|key| {
            (key == "AGENTGATE_RATELIMIT_PER_MINUTE").then(|| "not-a-number".to_string())
        });
        assert_eq!(config.limits.per_minute, 120);
    }
}
