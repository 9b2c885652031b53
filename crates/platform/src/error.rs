//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed message, out-of-phase message, framing violation)
    Protocol(String),

    /// Security error (MAC mismatch, decryption failure, signature rejected)
    Security(String),

    /// Key exchange error (no common algorithm, host key rejected)
    KeyExchange(String),

    /// A deadline elapsed before the operation completed
    Timeout(String),

    /// The peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// RFC 4253 section 11.1 reason code
        reason: u32,
        /// Human-readable description from the peer
        message: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::KeyExchange(msg) => write!(f, "Key exchange error: {}", msg),
            SkiffError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            SkiffError::Disconnected { reason, message } => {
                write!(f, "Peer disconnected (reason {}): {}", reason, message)
            }
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "stream closed");
        let skiff_err: SkiffError = io_err.into();
        assert!(matches!(skiff_err, SkiffError::Io(_)));
    }

    #[test]
    fn test_disconnect_display() {
        let err = SkiffError::Disconnected {
            reason: 2,
            message: "padding violation".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Peer disconnected (reason 2): padding violation"
        );
    }

    #[test]
    fn test_result_type() {
        fn example() -> SkiffResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
