use crate::failure::Failure;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// A declared failure from the control plane, already classified.
    #[error("{}", .0.message)]
    Remote(Failure),
    #[error("operation cancelled")]
    Cancelled,
    #[error("no active session for connection '{0}'")]
    SessionLost(String),
    #[error("{kind} '{reference}' not found")]
    ObjectNotFound {
        kind: &'static str,
        reference: String,
    },
    #[error("missing permission '{0}'")]
    PermissionDenied(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration parse error: {0}")]
    Serde(String),
}

impl PoolError {
    /// The raw remote error code, if this is a declared remote failure.
    /// Programmatic checks compare this, never the rendered message.
    pub fn code(&self) -> Option<&str> {
        match self {
            PoolError::Remote(f) => Some(&f.code),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PoolError::Remote(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Cancelled)
    }
}

impl From<Failure> for PoolError {
    fn from(failure: Failure) -> Self {
        PoolError::Remote(failure)
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::Serde(err.to_string())
    }
}

impl From<toml::ser::Error> for PoolError {
    fn from(err: toml::ser::Error) -> Self {
        PoolError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Serde(err.to_string())
    }
}
