//! Command line interface for the studio link

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use studio_link_core::codec::{Encode, PayloadReader, PayloadWriter};
use studio_link_core::config::DEFAULT_CONFIG_FILE;
use studio_link_core::{AdapterConfig, MessageKind, Role, Shape, Value};
use studio_link_shm::{MessageHandler, Outbox};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Configuration file
    #[clap(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run one end of the link and print what arrives
    Listen {
        /// Side to play
        #[clap(short, long)]
        role: Role,

        /// Payload layout of inbound messages, e.g. "list<i32>"
        #[clap(short, long)]
        shape: Option<Shape>,
    },

    /// Connect, send one message and exit
    Send {
        #[clap(short, long)]
        role: Role,

        /// Message kind, 4..=255
        #[clap(short, long)]
        kind: u8,

        /// Payload layout, e.g. "tuple<string,f32>"
        #[clap(short, long)]
        shape: Shape,

        /// Payload as JSON
        #[clap(long)]
        value: String,

        /// Write into the segment directly instead of queueing
        #[clap(long)]
        now: bool,

        /// How long to wait for the peer
        #[clap(long, default_value = "3000")]
        wait_ms: u64,
    },

    /// Connect and make both sides wipe their segments
    Reset {
        #[clap(short, long)]
        role: Role,

        #[clap(long, default_value = "3000")]
        wait_ms: u64,
    },

    /// Print the segment headers of the channel
    Status,

    /// Write the default configuration file
    Init {
        #[clap(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Replace an existing file
        #[clap(long)]
        force: bool,
    },
}

/// Explicit `--config`, else the first config file found, else defaults
pub fn load_config(cli: &Cli) -> Result<AdapterConfig> {
    if let Some(config_path) = &cli.config {
        AdapterConfig::from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))
    } else if let Some(config_path) = AdapterConfig::find_config_file() {
        AdapterConfig::from_file(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))
    } else {
        Ok(AdapterConfig::default())
    }
}

/// Write the default configuration, refusing to overwrite unless forced
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to replace it", path.display());
    }
    AdapterConfig::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Kind a consumer may send
pub fn parse_kind(kind: u8) -> Result<MessageKind> {
    let kind = MessageKind(kind);
    if kind.is_reserved() {
        bail!("Message kind {} is reserved for the transport", kind);
    }
    Ok(kind)
}

/// Turn a JSON argument into an encodable value of the given shape
pub fn parse_payload(shape: &Shape, json: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("Invalid JSON payload: {}", json))?;
    Value::from_json(shape, &json).with_context(|| format!("Payload does not match {}", shape))
}

/// Encode a value the way it will sit in the segment
pub fn encode_payload(value: &Value) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    value.encode(&mut writer);
    writer.as_slice().to_vec()
}

/// Poll until `condition` holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Prints each inbound message as one JSON line on stdout.
///
/// Without a shape the payload length is unknown, so the rest of the batch
/// is taken as this message's payload and reported as raw bytes.
pub struct Printer {
    shape: Option<Shape>,
}

impl Printer {
    pub fn new(shape: Option<Shape>) -> Self {
        Self { shape }
    }

    pub fn render(&self, kind: MessageKind, reader: &mut PayloadReader<'_>) -> studio_link_core::Result<serde_json::Value> {
        let payload = match &self.shape {
            Some(shape) => Value::decode(reader, shape)?.to_json(),
            None => {
                let raw = reader.read_raw(reader.remaining())?;
                serde_json::Value::from(raw.to_vec())
            }
        };
        Ok(serde_json::json!({ "kind": kind.as_u8(), "payload": payload }))
    }
}

impl MessageHandler for Printer {
    fn handle_message(
        &mut self,
        kind: MessageKind,
        reader: &mut PayloadReader<'_>,
        _outbox: &Outbox,
    ) -> studio_link_core::Result<()> {
        let line = self.render(kind, reader)?;
        println!("{}", line);
        Ok(())
    }

    fn connection_changed(&mut self, connected: bool, _outbox: &Outbox) {
        if connected {
            info!("Peer connected");
        } else {
            info!("Peer disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["studio-link", "status"]).unwrap();
        assert_eq!(cli.command, Command::Status);
        assert_eq!(cli.log_level, "info");
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "studio-link",
            "listen",
            "--role",
            "editor",
            "--config",
            "/path/to/link.toml",
            "--verbose",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Command::Listen {
                role: Role::Editor,
                shape: None
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/link.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_send_command() {
        let cli = Cli::try_parse_from([
            "studio-link",
            "send",
            "--role",
            "host",
            "--kind",
            "7",
            "--shape",
            "list<i32>",
            "--value",
            "[1, 2, 3]",
            "--now",
        ])
        .unwrap();

        match cli.command {
            Command::Send {
                role,
                kind,
                shape,
                value,
                now,
                wait_ms,
            } => {
                assert_eq!(role, Role::Host);
                assert_eq!(kind, 7);
                assert_eq!(shape, Shape::List(Box::new(Shape::I32)));
                assert_eq!(value, "[1, 2, 3]");
                assert!(now);
                assert_eq!(wait_ms, 3000);
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        assert!(Cli::try_parse_from(["studio-link", "listen", "--role", "server"]).is_err());
        assert!(Cli::try_parse_from(["studio-link", "listen", "--role", "host", "--shape", "list<"]).is_err());
        assert!(Cli::try_parse_from(["studio-link", "send", "--role", "host", "--kind", "300", "--shape", "u8", "--value", "1"]).is_err());
    }

    #[test]
    fn test_init_default_path() {
        let cli = Cli::try_parse_from(["studio-link", "init"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Init {
                path: PathBuf::from(DEFAULT_CONFIG_FILE),
                force: false
            }
        );
    }

    #[test]
    fn test_reserved_kinds_rejected() {
        assert!(parse_kind(0).is_err());
        assert!(parse_kind(1).is_err());
        assert!(parse_kind(2).is_err());
        assert!(parse_kind(3).is_err());
        assert_eq!(parse_kind(4).unwrap(), MessageKind(4));
    }

    #[test]
    fn test_payload_from_json() {
        let shape: Shape = "list<i32>".parse().unwrap();
        let value = parse_payload(&shape, "[1, -2]").unwrap();
        assert_eq!(encode_payload(&value), vec![2, 1, 0, 0, 0, 0xFE, 0xFF, 0xFF, 0xFF]);

        assert!(parse_payload(&shape, "[1, ").is_err());
        assert!(parse_payload(&shape, "\"text\"").is_err());
    }

    #[test]
    fn test_printer_renders_json() {
        let shape: Shape = "tuple<string,bool>".parse().unwrap();
        let value = parse_payload(&shape, r#"["hi", true]"#).unwrap();
        let bytes = encode_payload(&value);

        let printer = Printer::new(Some(shape));
        let mut reader = PayloadReader::new(&bytes);
        let line = printer.render(MessageKind(9), &mut reader).unwrap();
        assert_eq!(line, serde_json::json!({ "kind": 9, "payload": ["hi", true] }));
        assert!(reader.is_empty());

        let raw = Printer::new(None);
        let mut reader = PayloadReader::new(&[1, 2]);
        let line = raw.render(MessageKind(4), &mut reader).unwrap();
        assert_eq!(line, serde_json::json!({ "kind": 4, "payload": [1, 2] }));
    }

    #[test]
    fn test_write_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);

        write_default_config(&path, false).unwrap();
        assert_eq!(AdapterConfig::from_file(&path).unwrap(), AdapterConfig::default());

        assert!(write_default_config(&path, false).is_err());
        write_default_config(&path, true).unwrap();
    }
}
