//! Message kinds and endpoint roles

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire protocol revision announced to the peer on connect
pub const PROTOCOL_VERSION: u16 = 1;

/// One-byte message identifier.
///
/// Open set: consumers pick their own values above the reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(pub u8);

impl MessageKind {
    /// Never sent. Seeing it mid-stream means the segment is damaged.
    pub const NONE: MessageKind = MessageKind(0x00);
    /// Keep-alive with no payload
    pub const PING: MessageKind = MessageKind(0x01);
    /// Asks the peer to perform a full reset, no payload
    pub const RESET: MessageKind = MessageKind(0x02);
    /// Sender's protocol version as a `u16`, sent once per connection
    pub const VERSION: MessageKind = MessageKind(0x03);

    /// Kinds handled by the transport itself
    pub fn is_reserved(self) -> bool {
        self.0 <= Self::VERSION.0
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        MessageKind(value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "None"),
            Self::PING => write!(f, "Ping"),
            Self::RESET => write!(f, "Reset"),
            Self::VERSION => write!(f, "Version"),
            MessageKind(other) => write!(f, "#{}", other),
        }
    }
}

/// Which end of the link a process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The instrumented application
    Host,
    /// The interactive editor
    Editor,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Editor,
            Role::Editor => Role::Host,
        }
    }

    /// Name of the segment this role writes to
    pub fn outbound_segment(self, channel: &str) -> String {
        match self {
            Role::Host => host_to_editor(channel),
            Role::Editor => editor_to_host(channel),
        }
    }

    /// Name of the segment this role reads from
    pub fn inbound_segment(self, channel: &str) -> String {
        self.peer().outbound_segment(channel)
    }
}

fn host_to_editor(channel: &str) -> String {
    format!("{}_H2E", channel)
}

fn editor_to_host(channel: &str) -> String {
    format!("{}_E2H", channel)
}

/// Name of the lock guarding both segments of a channel
pub fn lock_name(channel: &str) -> String {
    format!("{}_Lock", channel)
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Editor => write!(f, "editor"),
        }
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "editor" => Ok(Role::Editor),
            other => Err(ConfigError::Invalid(format!("unknown role '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_kinds() {
        assert!(MessageKind::NONE.is_reserved());
        assert!(MessageKind::PING.is_reserved());
        assert!(MessageKind::RESET.is_reserved());
        assert!(MessageKind::VERSION.is_reserved());
        assert!(!MessageKind(4).is_reserved());
        assert!(!MessageKind(7).is_reserved());
        assert_eq!(MessageKind::VERSION.to_string(), "Version");
        assert_eq!(MessageKind::PING.to_string(), "Ping");
        assert_eq!(MessageKind(42).to_string(), "#42");
    }

    #[test]
    fn test_roles_cross_segments() {
        let channel = "Test";
        assert_eq!(Role::Host.outbound_segment(channel), "Test_H2E");
        assert_eq!(Role::Editor.inbound_segment(channel), "Test_H2E");
        assert_eq!(Role::Editor.outbound_segment(channel), "Test_E2H");
        assert_eq!(Role::Host.inbound_segment(channel), "Test_E2H");
        assert_eq!(lock_name(channel), "Test_Lock");
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Host".parse::<Role>().unwrap(), Role::Host);
        assert_eq!("editor".parse::<Role>().unwrap(), Role::Editor);
        assert!("studio".parse::<Role>().is_err());
    }
}
