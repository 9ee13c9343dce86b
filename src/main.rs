use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use studio_link::cli::{
    encode_payload, load_config, parse_kind, parse_payload, wait_for, write_default_config, Cli,
    Command, Printer,
};
use studio_link::studio_link_core::{AdapterConfig, MessageKind, PayloadReader, Role};
use studio_link::studio_link_shm::{Adapter, SharedSegment};
use tracing::{info, warn};

fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if cli.verbose {
        cli.log_level = "debug".to_string();
    }

    // stdout carries the JSON output
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::Init { path, force } => {
            write_default_config(path, *force)?;
            println!("Wrote default configuration to {}", path.display());
        }

        Command::Status => {
            let config = load_config(&cli)?;
            status(&config)?;
        }

        Command::Listen { role, shape } => {
            let config = load_config(&cli)?;
            listen(config, *role, Printer::new(shape.clone()))?;
        }

        Command::Send {
            role,
            kind,
            shape,
            value,
            now,
            wait_ms,
        } => {
            let config = load_config(&cli)?;
            let kind = parse_kind(*kind)?;
            let payload = encode_payload(&parse_payload(shape, value)?);
            let adapter = connect(config, *role, Duration::from_millis(*wait_ms))?;

            if *now {
                let stored = adapter
                    .write_message_now(kind, |writer| writer.write_raw(&payload))
                    .context("Failed to write message")?;
                if !stored {
                    bail!("Message did not fit into the outbound segment");
                }
            } else {
                adapter.queue_message(kind, |writer| writer.write_raw(&payload));
                let outbox = adapter.outbox();
                if !wait_for(Duration::from_millis(*wait_ms), || outbox.is_empty()) {
                    bail!("Message was not flushed within {} ms", wait_ms);
                }
            }

            // Let the peer pick it up before the segments go away
            thread::sleep(adapter.config().update_rate() * 2);
            let metrics = adapter.metrics();
            adapter.dispose();
            if metrics.messages_dropped > 0 {
                bail!("Message did not fit into the outbound segment");
            }
            info!("Sent message kind {} ({} bytes)", kind, payload.len());
        }

        Command::Reset { role, wait_ms } => {
            let config = load_config(&cli)?;
            let wait = Duration::from_millis(*wait_ms);
            let adapter = connect(config, *role, wait)?;

            adapter.force_reconnect().context("Failed to request reset")?;
            if !wait_for(wait, || adapter.metrics().full_resets > 0) {
                bail!("Reset did not happen within {} ms", wait_ms);
            }
            adapter.dispose();
            println!("Both sides were reset");
        }
    }

    Ok(())
}

/// Start an adapter with a handler that ignores inbound traffic and wait for the peer
fn connect(config: AdapterConfig, role: Role, wait: Duration) -> Result<Adapter> {
    let discard = |_kind: MessageKind, reader: &mut PayloadReader<'_>| -> studio_link::studio_link_core::Result<()> {
        reader.read_raw(reader.remaining())?;
        Ok(())
    };
    let adapter = Adapter::new(role, config, discard)
        .with_context(|| format!("Failed to start the {} side", role))?;

    if !wait_for(wait, || adapter.is_connected()) {
        adapter.dispose();
        bail!("Peer did not connect within {} ms", wait.as_millis());
    }
    Ok(adapter)
}

fn listen(config: AdapterConfig, role: Role, printer: Printer) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let adapter = Adapter::new(role, config, printer)
        .with_context(|| format!("Failed to start the {} side", role))?;
    info!("Listening as {}, press Ctrl-C to stop", role);

    while !stop.load(Ordering::SeqCst) {
        if !adapter.is_running() {
            warn!("Adapter stopped, exiting");
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let metrics = adapter.metrics();
    adapter.dispose();
    eprintln!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

/// Header snapshot of both directions. Read without the lock so a stale
/// abandonment marker stays for the adapters to find.
fn status(config: &AdapterConfig) -> Result<()> {
    let mut report = serde_json::Map::new();
    for role in [Role::Host, Role::Editor] {
        let name = config.outbound_segment(role);
        let segment = SharedSegment::open(&name, config)
            .with_context(|| format!("Failed to open segment {}", name))?;
        report.insert(name, serde_json::to_value(segment.stats())?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
