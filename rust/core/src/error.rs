//! Error types for the studio link core

use thiserror::Error;

/// Payload codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload ended before the value was complete
    #[error("Unexpected end of payload: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A 7-bit encoded integer ran past five bytes
    #[error("Malformed 7-bit encoded integer")]
    InvalidVarInt,

    /// A negative or oversized count/length prefix
    #[error("Invalid length prefix: {0}")]
    InvalidLength(i32),

    /// String bytes were not valid UTF-8
    #[error("Invalid UTF-8 encoding")]
    InvalidUtf8,

    /// Boolean byte other than 0 or 1
    #[error("Invalid boolean byte: 0x{0:02x}")]
    InvalidBool(u8),

    /// Enumeration value with no matching variant
    #[error("Invalid {type_name} discriminant: {value}")]
    InvalidEnum { type_name: &'static str, value: i32 },

    /// Tuple count prefix does not match the tuple arity
    #[error("Tuple arity mismatch: expected {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: i32 },

    /// The requested type has no codec
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A dynamic value does not fit its shape
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Convenience type alias for codec results
pub type Result<T> = std::result::Result<T, CodecError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values that cannot work together
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl CodecError {
    /// Check if the error means the bytes themselves are damaged, as opposed
    /// to the caller asking for something the codec cannot do
    pub fn is_corruption(&self) -> bool {
        !matches!(self, CodecError::UnsupportedType(_) | CodecError::InvalidValue(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(CodecError::InvalidVarInt.is_corruption());
        assert!(CodecError::UnexpectedEof { needed: 4, remaining: 1 }.is_corruption());
        assert!(!CodecError::UnsupportedType("char".to_string()).is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = CodecError::InvalidEnum { type_name: "Color", value: 9 };
        assert_eq!(err.to_string(), "Invalid Color discriminant: 9");
    }
}
