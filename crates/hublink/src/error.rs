//! CLI error types with miette diagnostics.
//!
//! Maps config, link, and sync errors into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use hublink_config::ConfigError;
use hublink_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to the {link} at {url}")]
    #[diagnostic(
        code(hublink::connection_failed),
        help(
            "Check that the {link} is running and reachable.\n\
             Run with -vv to see each connection attempt."
        )
    )]
    ConnectionFailed {
        link: &'static str,
        url: String,
        #[source]
        source: hublink_api::Error,
    },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(hublink::auth_failed),
        help("Check the token configured under [controller] or [cloud].")
    )]
    AuthFailed { message: String },

    #[error("No token configured for [{section}]")]
    #[diagnostic(
        code(hublink::no_credentials),
        help(
            "Set `token_env` to the name of an environment variable holding the token,\n\
             or set `token` in the config file. Run: hublink config path"
        )
    )]
    NoCredentials { section: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Missing setting `{field}`")]
    #[diagnostic(
        code(hublink::missing_setting),
        help("Set it in the config file or via {env}. Create a file with: hublink config init")
    )]
    MissingSetting { field: String, env: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hublink::validation))]
    Validation { field: String, reason: String },

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(hublink::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(hublink::config))]
    Config(Box<ConfigError>),

    // ── Sync ─────────────────────────────────────────────────────────
    #[error("Sync failed ({code}): {message}")]
    #[diagnostic(code(hublink::sync_failed))]
    SyncFailed { code: String, message: String },

    #[error("Nothing to sync: the cloud has no devices registered for this agent")]
    #[diagnostic(
        code(hublink::nothing_to_sync),
        help("Run once with --home-id (or set sync.home_id) to register devices.")
    )]
    NothingToSync,

    #[error("{message} ({code})")]
    #[diagnostic(code(hublink::remote))]
    Remote { code: String, message: String },

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {timeout_ms}ms")]
    #[diagnostic(
        code(hublink::timeout),
        help("Raise controller.request_timeout_secs or cloud.ack_timeout_secs.")
    )]
    Timeout { timeout_ms: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(hublink::render))]
    Render(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::MissingSetting { .. } | Self::Validation { .. } => exit_code::USAGE,
            Self::ConfigExists { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Config(_)
            | Self::SyncFailed { .. }
            | Self::NothingToSync
            | Self::Remote { .. }
            | Self::Io(_)
            | Self::Render(_) => exit_code::GENERAL,
        }
    }
}

/// `controller.url` → `HUBLINK_CONTROLLER_URL`.
fn env_var_for(field: &str) -> String {
    format!(
        "{}{}",
        hublink_config::ENV_PREFIX,
        field.replace('.', "_").to_uppercase()
    )
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { field } => Self::MissingSetting {
                env: env_var_for(&field),
                field,
            },
            ConfigError::NoCredentials { section } => Self::NoCredentials { section },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(Box::new(other)),
        }
    }
}

impl From<hublink_api::Error> for CliError {
    fn from(err: hublink_api::Error) -> Self {
        match err {
            hublink_api::Error::Authentication { message } => Self::AuthFailed { message },
            hublink_api::Error::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            other => Self::Remote {
                code: other.remote_code().unwrap_or("link_error").to_owned(),
                message: other.to_string(),
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Authentication { message } => Self::AuthFailed { message },
            CoreError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            other => Self::Remote {
                code: other.code().to_owned(),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Render(err.to_string())
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Render(err.to_string())
    }
}
