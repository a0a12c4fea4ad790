use thiserror::Error;

/// Result alias for configuration and payload handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to load settings or to read a signaling payload.
#[derive(Debug, Error)]
pub enum Error {
    /// A JSON document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A setting was missing, malformed or out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// An SDP type, session description or ICE candidate was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Wraps any displayable cause as [`Error::Serialization`].
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Wraps any displayable cause as [`Error::Config`].
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Wraps any displayable cause as [`Error::Protocol`].
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
