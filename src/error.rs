//! Error taxonomy for the voice engine server.
//!
//! Everything that can go wrong while serving one connection is converted
//! into a response (or a clean close) at the dispatcher boundary. Only
//! [`ServerError`] ever reaches `main`.

use thiserror::Error;

/// A configured backend could not be brought up. Never fatal: the backend
/// is left out of the registry and startup continues.
#[derive(Debug, Error)]
pub enum BackendInitError {
    #[error("backend '{backend}' is missing required setting '{setting}'")]
    MissingSetting {
        backend: String,
        setting: &'static str,
    },

    #[error("backend '{backend}' has unknown kind '{kind}'")]
    UnknownKind { backend: String, kind: String },

    #[error("backend '{backend}' failed its voice probe: {source}")]
    Probe {
        backend: String,
        #[source]
        source: std::io::Error,
    },
}

/// Framing-level failures on the duplex channel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection before sending a message")]
    Closed,

    #[error("frame of {len} bytes exceeds the {max} byte chunk limit")]
    Oversized { len: usize, max: usize },

    #[error("message exceeds the {max} byte limit")]
    MessageTooLarge { max: usize },

    #[error("failed to decompress message: {0}")]
    Decompress(std::io::Error),

    #[error("stream ended before its terminator frame")]
    Truncated,

    #[error("no complete request within {0:?}")]
    TimedOut(std::time::Duration),
}

impl CodecError {
    /// Whether the byte stream is still in sync, so an error response can
    /// still be written on the same connection.
    pub fn is_framing_intact(&self) -> bool {
        matches!(self, CodecError::Decompress(_) | CodecError::MessageTooLarge { .. })
    }
}

/// A message was framed correctly but is not a valid request.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("engine '{engine}' does not match engine '{combo_engine}' in engine_voice_combo")]
    EngineMismatch { engine: String, combo_engine: String },

    #[error("action '{action}' requires field '{field}'")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
}

/// Persisting a voice or the engine adapter into the system store failed.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("configuration store error: {0}")]
    Store(#[from] sled::Error),

    #[error("cannot create store directory '{path}': {source}")]
    StoreDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt registration value at '{path}': {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("registration at '{path}' is missing attribute '{name}'")]
    MissingAttribute { path: String, name: &'static str },

    #[error("registration lock poisoned")]
    Poisoned,
}

/// Errors raised while handling one request, before a response is chosen.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("engine '{0}' is not available")]
    EngineNotFound(String),

    #[error("voice '{voice}' not found for engine '{engine}'")]
    VoiceNotFound { engine: String, voice: String },

    #[error("{0}")]
    BackendCall(#[from] std::io::Error),

    #[error("backend task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Failures seen by a client of the endpoint.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach voice engine server at '{endpoint}': {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unreadable response: {0}")]
    Response(#[from] serde_json::Error),

    #[error("server answered {status}: {message}")]
    Rejected { status: String, message: String },
}

/// Fatal conditions: the service cannot start.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid settings: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("failed to bind endpoint '{endpoint}': {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}
