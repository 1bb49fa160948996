//! Configuration for the hublink agent.
//!
//! One TOML file (platform config dir) layered under `HUBLINK_`-prefixed
//! environment variables, credential resolution for both links, and
//! translation into the runtime configs `hublink-api` and `hublink-core`
//! consume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use hublink_api::{CloudLinkConfig, ControllerLinkConfig, ReconnectConfig};
use hublink_core::SyncConfig;

/// Environment prefix. `HUBLINK_CONTROLLER_URL` sets `controller.url`,
/// `HUBLINK_SYNC_HOME_ID` sets `sync.home_id`.
pub const ENV_PREFIX: &str = "HUBLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("missing {field}")]
    Missing { field: String },

    #[error("no token configured for [{section}] (set `token_env` or `token`)")]
    NoCredentials { section: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub controller: ControllerSection,

    #[serde(default)]
    pub cloud: CloudSection,

    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentSection {
    /// Identity presented to the cloud (`X-Agent-Id`) and used as the
    /// `source` of every push.
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControllerSection {
    /// Controller base URL (e.g., "http://homeassistant.local:8123").
    pub url: Option<String>,

    /// Long-lived access token (plaintext; prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable holding the access token.
    pub token_env: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Consecutive failed reconnects before the link gives up. `0` retries
    /// forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            token_env: None,
            request_timeout_secs: default_request_timeout(),
            ping_interval_secs: default_ping_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudSection {
    /// Event-socket URL (e.g., "wss://cloud.example.com/agent").
    pub url: Option<String>,

    /// Bearer token (plaintext; prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable holding the bearer token.
    pub token_env: Option<String>,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Deadline for acknowledged requests such as `agent:sync`.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            token_env: None,
            idle_timeout_secs: default_idle_timeout(),
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncSection {
    /// Home to sync on `hublink run` when no `--home-id` is given.
    pub home_id: Option<String>,

    #[serde(default = "default_true")]
    pub auto_restore: bool,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            home_id: None,
            auto_restore: true,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    30
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_idle_timeout() -> u64 {
    45
}
fn default_ack_timeout() -> u64 {
    30
}
fn default_command_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

// ── Runtime config ──────────────────────────────────────────────────

/// Everything needed to start an agent, validated.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub controller: ControllerLinkConfig,
    pub cloud: CloudLinkConfig,
    pub sync: SyncConfig,
    pub home_id: Option<String>,
}

impl Config {
    /// Validate and build the link and sync configs.
    pub fn to_agent_config(&self) -> Result<AgentConfig, ConfigError> {
        let agent_id = self
            .agent
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::Missing {
                field: "agent.id".into(),
            })?
            .to_owned();

        Ok(AgentConfig {
            controller: self.controller_link_config()?,
            cloud: self.cloud_link_config(&agent_id)?,
            sync: self.sync_config()?,
            home_id: self.sync.home_id.clone(),
            agent_id,
        })
    }

    /// Controller settings alone, for commands that never touch the cloud.
    pub fn controller_link_config(&self) -> Result<ControllerLinkConfig, ConfigError> {
        let section = &self.controller;
        let url = parse_url("controller.url", section.url.as_deref())?;
        let token = resolve_token(
            section.token_env.as_deref(),
            section.token.as_deref(),
            "controller",
        )?;

        let mut config = ControllerLinkConfig::new(url, token);
        config.request_timeout = positive_secs(
            "controller.request_timeout_secs",
            section.request_timeout_secs,
        )?;
        config.ping_interval =
            positive_secs("controller.ping_interval_secs", section.ping_interval_secs)?;
        config.reconnect = match section.max_reconnect_attempts {
            0 => ReconnectConfig::default(),
            attempts => ReconnectConfig::bounded(attempts),
        };
        Ok(config)
    }

    fn cloud_link_config(&self, agent_id: &str) -> Result<CloudLinkConfig, ConfigError> {
        let section = &self.cloud;
        let url = parse_url("cloud.url", section.url.as_deref())?;
        let token = resolve_token(section.token_env.as_deref(), section.token.as_deref(), "cloud")?;

        let mut config = CloudLinkConfig::new(url, token, agent_id);
        config.idle_timeout = positive_secs("cloud.idle_timeout_secs", section.idle_timeout_secs)?;
        Ok(config)
    }

    fn sync_config(&self) -> Result<SyncConfig, ConfigError> {
        let ack_timeout = positive_secs("cloud.ack_timeout_secs", self.cloud.ack_timeout_secs)?;
        let defaults = SyncConfig::default();
        Ok(SyncConfig {
            auto_restore: self.sync.auto_restore,
            submit_timeout: ack_timeout,
            restore_timeout: defaults.restore_timeout.min(ack_timeout),
            command_timeout: positive_secs(
                "sync.command_timeout_secs",
                self.sync.command_timeout_secs,
            )?,
        })
    }
}

fn parse_url(field: &str, raw: Option<&str>) -> Result<Url, ConfigError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::Missing {
            field: field.into(),
        })?;
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve a token: the named env var first, then the plaintext value.
pub fn resolve_token(
    token_env: Option<&str>,
    token: Option<&str>,
    section: &str,
) -> Result<SecretString, ConfigError> {
    // 1. Env var named by `token_env`
    if let Some(value) = token_env
        .and_then(|name| std::env::var(name).ok())
        .filter(|value| !value.is_empty())
    {
        return Ok(SecretString::from(value));
    }

    // 2. Plaintext in config
    if let Some(value) = token.filter(|value| !value.is_empty()) {
        return Ok(SecretString::from(value.to_owned()));
    }

    Err(ConfigError::NoCredentials {
        section: section.into(),
    })
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "hublink", "hublink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hublink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file is not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(env_provider());

    let config: Config = figment.extract()?;
    Ok(config)
}

/// `HUBLINK_<SECTION>_<KEY>`: the first underscore after the prefix
/// separates section from key, so keys keep their own underscores.
fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| key.as_str().replacen('_', ".", 1).into())
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Starter file written by `hublink config init`.
pub fn template() -> Config {
    Config {
        agent: AgentSection {
            id: Some("hublink-agent".into()),
        },
        controller: ControllerSection {
            url: Some("http://homeassistant.local:8123".into()),
            token_env: Some("HUBLINK_CONTROLLER_TOKEN".into()),
            ..ControllerSection::default()
        },
        cloud: CloudSection {
            url: Some("wss://cloud.example.com/agent".into()),
            token_env: Some("HUBLINK_CLOUD_TOKEN".into()),
            ..CloudSection::default()
        },
        sync: SyncSection::default(),
    }
}
