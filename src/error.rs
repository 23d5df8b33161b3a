use thiserror::Error;

/// Errors that can occur on the hub connection session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Authentication rejected by hub: {0}")]
    AuthRejected(String),

    #[error("Authentication timed out after {0}ms")]
    AuthTimeout(u64),

    #[error("Unexpected frame during handshake: {0}")]
    Protocol(String),

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

impl SessionError {
    /// Whether this error requires external intervention
    ///
    /// Only auth failures and reconnect exhaustion end the pipeline;
    /// everything else is retried inside the session loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::AuthRejected(_)
                | SessionError::AuthTimeout(_)
                | SessionError::ReconnectExhausted { .. }
        )
    }
}

/// Errors that can occur while forwarding kept events
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Broker publish failed: {0}")]
    Publish(String),

    #[error("Publish retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Store write failed: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Errors that can occur on the stats/health read API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to bind stats API listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Stats API server terminated: {0}")]
    Serve(std::io::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
