//! Wire-level error type.

use std::fmt;

/// Network connection error.
#[derive(Debug)]
pub enum WireError {
    Connect(String),
    Codec(String),
    Io(std::io::Error),
    Handshake(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Connect(e) => write!(f, "connection failed: {e}"),
            WireError::Codec(e) => write!(f, "codec error: {e}"),
            WireError::Io(e) => write!(f, "IO error: {e}"),
            WireError::Handshake(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}
