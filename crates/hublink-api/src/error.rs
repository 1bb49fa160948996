use thiserror::Error;

/// Top-level error type for the `hublink-api` crate.
///
/// Covers every failure mode of both protocol links: socket transport,
/// authentication, correlated request/response, and acknowledged emits.
/// `hublink-core` maps these into its sync-level taxonomy.
///
/// `Clone` so a single failure (e.g. a dropped socket) can be fanned out
/// to every waiter that was pending on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The controller rejected the bearer credential (`auth_invalid`).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level failure (connection refused, DNS failure, TLS, reset).
    #[error("Transport error: {0}")]
    Transport(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// URL parsed but cannot be used for a WebSocket upgrade.
    #[error("Unsupported URL scheme '{scheme}' (expected ws, wss, http or https)")]
    UnsupportedScheme { scheme: String },

    /// No response (or acknowledgement) arrived before the deadline.
    ///
    /// Distinct from [`Protocol`](Self::Protocol): the remote may still
    /// process the request.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The link is not in its `Connected` state. Requests are never queued.
    #[error("Not connected")]
    NotConnected,

    /// The socket dropped while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Backoff gave up after the configured number of attempts.
    #[error("Reconnection limit reached after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // ── Protocol ────────────────────────────────────────────────────
    /// The controller answered with `success: false` or sent a malformed frame.
    #[error("Protocol error ({code}): {message}")]
    Protocol { code: String, message: String },

    /// The cloud acknowledged an emit with an explicit failure payload.
    #[error("Remote reported failure: {message}")]
    Remote { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` for deadline failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::NotConnected | Self::ConnectionClosed
        )
    }

    /// Extract the remote error code, if available.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Protocol { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: String::new(),
        }
    }
}
