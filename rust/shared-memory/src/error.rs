//! Shared memory specific error types

use studio_link_core::{CodecError, ConfigError};
use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Region name the platform cannot use
    #[error("Invalid region name: {0}")]
    InvalidName(String),

    /// Invalid region size
    #[error("Invalid region size: {size}, must be between {min} and {max}")]
    InvalidSize { size: usize, min: usize, max: usize },

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Cross-process lock could not be created or taken
    #[error("Lock error: {0}")]
    Lock(String),

    /// Backing that this platform does not offer
    #[error("Unsupported backing: {0}")]
    Unsupported(String),

    /// Code running on the tick thread panicked
    #[error("Tick panicked: {0}")]
    Panicked(String),

    /// The adapter thread is gone
    #[error("Adapter is not running")]
    NotRunning,

    /// Payload codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

impl SharedMemoryError {
    /// Check if the error is worth retrying on a later tick. Anything else
    /// sends the adapter straight to a full reset.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SharedMemoryError::Lock(_)
            | SharedMemoryError::Panicked(_) => true,
            SharedMemoryError::Codec(err) => err.is_corruption(),
            SharedMemoryError::Io(err) => {
                matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Convert platform-specific error codes to SharedMemoryError
    pub fn from_platform_error(error: i32, message: impl Into<String>) -> Self {
        match error {
            13 => SharedMemoryError::PermissionDenied(message.into()), // EACCES
            22 => SharedMemoryError::InvalidName(message.into()),      // EINVAL
            _ => SharedMemoryError::Platform(format!("Error {}: {}", error, message.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SharedMemoryError::Lock("flock failed".to_string()).is_recoverable());
        assert!(SharedMemoryError::Panicked("boom".to_string()).is_recoverable());
        assert!(SharedMemoryError::Codec(CodecError::InvalidVarInt).is_recoverable());
        assert!(!SharedMemoryError::Codec(CodecError::UnsupportedType("x".into())).is_recoverable());
        assert!(!SharedMemoryError::MappingFailed("mmap".to_string()).is_recoverable());
        assert!(!SharedMemoryError::Io(std::io::ErrorKind::PermissionDenied.into()).is_recoverable());
        assert!(SharedMemoryError::Io(std::io::ErrorKind::Interrupted.into()).is_recoverable());
    }

    #[test]
    fn test_platform_error_mapping() {
        assert!(matches!(
            SharedMemoryError::from_platform_error(13, "shm_open"),
            SharedMemoryError::PermissionDenied(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_platform_error(5, "shm_open"),
            SharedMemoryError::Platform(msg) if msg.contains("Error 5")
        ));
    }
}
