//! Adapter: one end of the link
//!
//! Each process runs one adapter. It owns the inbound and outbound segment
//! of its role, polls them on a dedicated thread at a fixed rate and keeps
//! track of whether the peer is alive from the traffic it sees. Silence is
//! normal; a ping every interval tells the peer we are still here.

use crate::error::{Result, SharedMemoryError};
use crate::lock::CrossProcessLock;
use crate::protocol::SharedSegment;
use crate::region::SharedMemoryRegion;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use studio_link_core::codec::{Encode, PayloadReader, PayloadWriter};
use studio_link_core::{AdapterConfig, MessageKind, Role};
use tracing::{debug, error, info, instrument, trace, warn};

/// Receives inbound messages on the tick thread.
///
/// Calls happen while the cross-process lock is held, so implementations
/// should return quickly. Replies go through the [`Outbox`].
pub trait MessageHandler: Send + 'static {
    /// Decode and act on one message. The payload must be read completely;
    /// an error here is treated as a damaged segment.
    fn handle_message(
        &mut self,
        kind: MessageKind,
        reader: &mut PayloadReader<'_>,
        outbox: &Outbox,
    ) -> studio_link_core::Result<()>;

    /// Fired on every connected/disconnected transition
    fn connection_changed(&mut self, connected: bool, outbox: &Outbox) {
        let _ = (connected, outbox);
    }

    /// The peer speaks another protocol version. The link stops right after.
    fn protocol_mismatch(&mut self, ours: u16, theirs: u16) {
        let _ = (ours, theirs);
    }
}

impl<F> MessageHandler for F
where
    F: FnMut(MessageKind, &mut PayloadReader<'_>) -> studio_link_core::Result<()> + Send + 'static,
{
    fn handle_message(
        &mut self,
        kind: MessageKind,
        reader: &mut PayloadReader<'_>,
        _outbox: &Outbox,
    ) -> studio_link_core::Result<()> {
        self(kind, reader)
    }
}

/// Pending outbound messages, flushed on the next tick while connected
#[derive(Clone, Default)]
pub struct Outbox {
    queue: Arc<Mutex<Vec<(MessageKind, Bytes)>>>,
    closed: Arc<AtomicBool>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a message now and send it with the next tick.
    /// Reserved kinds belong to the transport and are ignored.
    pub fn queue_message<F>(&self, kind: MessageKind, write: F)
    where
        F: FnOnce(&mut PayloadWriter),
    {
        if kind.is_reserved() {
            warn!("Ignoring queued message with reserved kind {}", kind);
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            debug!("Link stopped, dropping message {}", kind);
            return;
        }

        let mut writer = PayloadWriter::new();
        write(&mut writer);
        self.queue.lock().push((kind, writer.freeze()));
    }

    pub fn queue<T: Encode + ?Sized>(&self, kind: MessageKind, value: &T) {
        self.queue_message(kind, |writer| value.encode(writer));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn take(&self) -> Vec<(MessageKind, Bytes)> {
        std::mem::take(&mut *self.queue.lock())
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Refuse everything from now on
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox").field("pending", &self.len()).finish()
    }
}

/// Why the segments were wiped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// The peer sent `Reset`
    PeerReset,
    /// The previous lock owner died holding it
    Abandoned,
    /// Faults kept repeating within the crash window
    CrashLoop,
    /// Asked for locally
    Requested,
    /// A fault that retrying will not fix
    Fault,
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResetCause::PeerReset => "peer requested reset",
            ResetCause::Abandoned => "lock abandoned",
            ResetCause::CrashLoop => "crash loop",
            ResetCause::Requested => "reset requested",
            ResetCause::Fault => "unrecoverable fault",
        };
        f.write_str(text)
    }
}

/// Result of one tick, consumed by the loop driver
#[derive(Debug)]
pub enum TickOutcome {
    Ok,
    TransientFault(SharedMemoryError),
    NeedsFullReset(ResetCause),
}

/// Counters exposed through [`Adapter::metrics`]
#[derive(Debug, Default)]
struct AdapterMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    pings_sent: AtomicU64,
    full_resets: AtomicU64,
    faults: AtomicU64,
    corruption_events: AtomicU64,
    connection_changes: AtomicU64,
    restarts: AtomicU64,
}

impl AdapterMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AdapterMetricsSnapshot {
        AdapterMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            full_resets: self.full_resets.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            corruption_events: self.corruption_events.load(Ordering::Relaxed),
            connection_changes: self.connection_changes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub pings_sent: u64,
    pub full_resets: u64,
    pub faults: u64,
    pub corruption_events: u64,
    pub connection_changes: u64,
    /// Tick loop restarts after a crash loop outlived its reset
    pub restarts: u64,
}

/// Segment pair guarded by the cross-process lock
struct Segments {
    inbound: SharedSegment,
    outbound: SharedSegment,
}

/// Connection bookkeeping private to the tick thread
struct ConnectionState {
    connected: bool,
    last_message: Instant,
    /// `None` until the first ping, so it goes out on the first tick
    last_ping: Option<Instant>,
    /// Our version went out on this connection
    version_sent: bool,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            connected: false,
            last_message: Instant::now(),
            last_ping: None,
            version_sent: false,
        }
    }
}

/// What the loop driver does about a failed tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultAction {
    /// Run the next tick as usual
    Retry,
    /// Wipe the segments, keep ticking
    Reset(ResetCause),
    /// Wipe the segments, pause for a crash window, then start over
    Restart,
}

/// Fault history of one run of the tick loop
struct CrashTracker {
    window: Duration,
    last_fault: Option<Instant>,
    last_crash_reset: Option<Instant>,
}

impl CrashTracker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_fault: None,
            last_crash_reset: None,
        }
    }

    fn within_window(&self, since: Option<Instant>, now: Instant) -> bool {
        since.map_or(false, |last| now.duration_since(last) < self.window)
    }

    fn record(&mut self, now: Instant, recoverable: bool) -> FaultAction {
        let repeated = self.within_window(self.last_fault, now);
        self.last_fault = Some(now);

        if recoverable && !repeated {
            FaultAction::Retry
        } else if self.within_window(self.last_crash_reset, now) {
            FaultAction::Restart
        } else {
            self.last_crash_reset = Some(now);
            self.last_fault = None;
            if repeated {
                FaultAction::Reset(ResetCause::CrashLoop)
            } else {
                FaultAction::Reset(ResetCause::Fault)
            }
        }
    }
}

/// State shared between the adapter handle and its tick thread
struct Inner {
    role: Role,
    config: AdapterConfig,
    lock: CrossProcessLock<Segments>,
    outbox: Outbox,
    handler: Mutex<Box<dyn MessageHandler>>,
    metrics: AdapterMetrics,
    stop: AtomicBool,
    running: AtomicBool,
    connected: AtomicBool,
    reset_requested: AtomicBool,
    /// Abandonment seen outside the tick thread
    abandoned: AtomicBool,
    /// Send `Reset` to the peer with the next requested reset
    notify_peer: AtomicBool,
}

impl Inner {
    fn open(role: Role, config: AdapterConfig, handler: Box<dyn MessageHandler>) -> Result<Self> {
        config.validate()?;

        let inbound = SharedSegment::open(&config.inbound_segment(role), &config)?;
        let outbound = SharedSegment::open(&config.outbound_segment(role), &config)?;
        let lock = CrossProcessLock::open(config.lock_name(), Segments { inbound, outbound })?;

        // Clean up whatever a previous session left behind
        {
            let mut segments = lock.acquire()?;
            if segments.was_abandoned() {
                warn!("Previous session died holding the lock, starting from empty segments");
            }
            segments.inbound.reset_header();
            segments.outbound.reset_header();
        }

        Ok(Self {
            role,
            config,
            lock,
            outbox: Outbox::new(),
            handler: Mutex::new(handler),
            metrics: AdapterMetrics::default(),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            notify_peer: AtomicBool::new(false),
        })
    }

    fn set_connected(&self, state: &mut ConnectionState, connected: bool) {
        if state.connected == connected {
            return;
        }

        state.connected = connected;
        state.version_sent = false;
        self.connected.store(connected, Ordering::SeqCst);
        AdapterMetrics::bump(&self.metrics.connection_changes);
        info!(role = %self.role, "Connection changed: {}", connected);
        self.handler.lock().connection_changed(connected, &self.outbox);
    }

    /// One poll of both segments under the cross-process lock
    fn tick(&self, state: &mut ConnectionState) -> TickOutcome {
        if self.abandoned.swap(false, Ordering::SeqCst) {
            return TickOutcome::NeedsFullReset(ResetCause::Abandoned);
        }
        if self.reset_requested.swap(false, Ordering::SeqCst) {
            return TickOutcome::NeedsFullReset(ResetCause::Requested);
        }

        let now = Instant::now();
        let mut segments = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(err) => return TickOutcome::TransientFault(err),
        };
        if segments.was_abandoned() {
            return TickOutcome::NeedsFullReset(ResetCause::Abandoned);
        }

        // Read
        let header = segments.inbound.read_header();
        if header.message_count > 0 {
            state.last_message = now;
            self.set_connected(state, true);
        } else if now.duration_since(state.last_message) > self.config.timeout_delay() {
            self.set_connected(state, false);
        }

        if header.message_count > 0 {
            let mut peer_reset = false;
            let mut peer_version = None;
            let ours = self.config.protocol_version;
            let mut handler = self.handler.lock();
            let report = segments.inbound.read_messages(self.config.max_messages, |kind, reader| {
                match kind {
                    MessageKind::PING => Ok(ControlFlow::Continue(())),
                    MessageKind::RESET => {
                        peer_reset = true;
                        Ok(ControlFlow::Break(()))
                    }
                    MessageKind::VERSION => {
                        let theirs = reader.read_u16()?;
                        if theirs == ours {
                            Ok(ControlFlow::Continue(()))
                        } else {
                            peer_version = Some(theirs);
                            Ok(ControlFlow::Break(()))
                        }
                    }
                    _ => {
                        trace!("Handling message {}", kind);
                        handler.handle_message(kind, reader, &self.outbox)?;
                        AdapterMetrics::bump(&self.metrics.messages_received);
                        Ok(ControlFlow::Continue(()))
                    }
                }
            });
            drop(handler);

            if report.corruption.is_some() {
                AdapterMetrics::bump(&self.metrics.corruption_events);
            }

            if peer_reset {
                debug!("Received message Reset");
                self.set_connected(state, false);
                return TickOutcome::NeedsFullReset(ResetCause::PeerReset);
            }

            if let Some(theirs) = peer_version {
                error!("Peer speaks protocol version {}, this side {}; stopping", theirs, ours);
                segments.inbound.reset_header();
                self.stop.store(true, Ordering::SeqCst);
                self.set_connected(state, false);
                self.handler.lock().protocol_mismatch(ours, theirs);
                return TickOutcome::Ok;
            }

            segments.inbound.reset_header();
        }

        // Write
        let mut wrote_message = false;
        if state.connected && !state.version_sent {
            let version = self.config.protocol_version.to_le_bytes();
            if segments.outbound.append_message(MessageKind::VERSION, &version) {
                state.version_sent = true;
                wrote_message = true;
            }
        }
        if state.connected {
            for (kind, payload) in self.outbox.take() {
                if segments.outbound.append_message(kind, &payload) {
                    wrote_message = true;
                    AdapterMetrics::bump(&self.metrics.messages_sent);
                } else {
                    AdapterMetrics::bump(&self.metrics.messages_dropped);
                    debug!("Outbound segment full, dropped message {}", kind);
                }
            }
        }

        let ping_due = state
            .last_ping
            .map_or(true, |last| now.duration_since(last) > self.config.ping_interval());
        if ping_due {
            // Any stored message already keeps the peer's timeout at bay
            if !wrote_message
                && segments.outbound.read_header().message_count == 0
                && segments.outbound.append_message(MessageKind::PING, &[])
            {
                AdapterMetrics::bump(&self.metrics.pings_sent);
            }
            state.last_ping = Some(now);
        }

        TickOutcome::Ok
    }

    /// Wipe both segments and start over as disconnected
    #[instrument(skip(self, state), fields(role = %self.role))]
    fn full_reset(&self, state: &mut ConnectionState, cause: ResetCause) {
        warn!("Resetting communication: {}", cause);
        AdapterMetrics::bump(&self.metrics.full_resets);
        self.outbox.clear();

        match self.lock.acquire() {
            Ok(mut segments) => {
                segments.inbound.reset_header();
                segments.outbound.reset_header();
                // Written after the wipe so the peer still sees it
                if cause == ResetCause::Requested
                    && self.notify_peer.swap(false, Ordering::SeqCst)
                    && segments.outbound.append_message(MessageKind::RESET, &[])
                {
                    AdapterMetrics::bump(&self.metrics.messages_sent);
                }
            }
            Err(err) => error!("Failed to clear segments during reset: {}", err),
        }

        self.set_connected(state, false);
        *state = ConnectionState::new();
    }

    /// Store one message straight away, outside the tick cadence
    fn write_now(&self, kind: MessageKind, payload: &[u8]) -> Result<bool> {
        let mut segments = self.lock.acquire()?;
        if segments.was_abandoned() {
            // Segment contents are unknown; the tick thread wipes them
            self.abandoned.store(true, Ordering::SeqCst);
            return Ok(false);
        }

        let stored = segments.outbound.append_message(kind, payload);
        if stored {
            AdapterMetrics::bump(&self.metrics.messages_sent);
        } else {
            AdapterMetrics::bump(&self.metrics.messages_dropped);
        }
        Ok(stored)
    }

    /// Sleep through one crash window, or until stopped
    fn cool_down(&self) {
        let deadline = Instant::now() + self.config.crash_window();
        let step = self.config.update_rate();
        while !self.stop.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(step);
        }
    }

    fn run(&self) {
        let update_rate = self.config.update_rate();
        let mut state = ConnectionState::new();
        let mut crashes = CrashTracker::new(self.config.crash_window());

        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(update_rate);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| self.tick(&mut state)))
                .unwrap_or_else(|panic| {
                    TickOutcome::TransientFault(SharedMemoryError::Panicked(panic_message(&*panic)))
                });

            let action = match outcome {
                TickOutcome::Ok => FaultAction::Retry,
                TickOutcome::NeedsFullReset(cause) => FaultAction::Reset(cause),
                TickOutcome::TransientFault(err) => {
                    AdapterMetrics::bump(&self.metrics.faults);
                    error!("Communication tick failed: {}", err);
                    crashes.record(Instant::now(), err.is_recoverable())
                }
            };

            let cause = match action {
                FaultAction::Retry => continue,
                FaultAction::Reset(cause) => cause,
                FaultAction::Restart => ResetCause::CrashLoop,
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.full_reset(&mut state, cause))) {
                error!("Full reset panicked: {}", panic_message(&*panic));
            }

            if action == FaultAction::Restart {
                error!(
                    "Tick keeps failing after a reset, restarting communication in {:?}",
                    self.config.crash_window()
                );
                AdapterMetrics::bump(&self.metrics.restarts);
                self.cool_down();
                crashes = CrashTracker::new(self.config.crash_window());
            }
        }

        self.outbox.close();
        self.running.store(false, Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One end of the link
pub struct Adapter {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Adapter {
    /// Map both segments, clear them and start the tick thread
    #[instrument(skip(config, handler), fields(channel = %config.channel))]
    pub fn new<H: MessageHandler>(role: Role, config: AdapterConfig, handler: H) -> Result<Self> {
        info!("Starting communication as {}", role);
        let inner = Arc::new(Inner::open(role, config, Box::new(handler))?);

        let worker = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name(format!("studio-link-{}", role))
            .spawn(move || worker.run())?;

        info!("Communication started");
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// False once the tick thread has stopped, either by `dispose` or
    /// because the peer runs another protocol version
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> AdapterMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Handle for queueing from other threads
    pub fn outbox(&self) -> Outbox {
        self.inner.outbox.clone()
    }

    /// Send with the next tick. Cheap, never blocks on the peer.
    pub fn queue_message<F>(&self, kind: MessageKind, write: F)
    where
        F: FnOnce(&mut PayloadWriter),
    {
        self.inner.outbox.queue_message(kind, write);
    }

    pub fn queue<T: Encode + ?Sized>(&self, kind: MessageKind, value: &T) {
        self.inner.outbox.queue(kind, value);
    }

    /// Write straight into the outbound segment, blocking until the lock is
    /// free. Returns whether the message fit.
    pub fn write_message_now<F>(&self, kind: MessageKind, write: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadWriter),
    {
        if kind.is_reserved() {
            warn!("Refusing to write reserved kind {}", kind);
            return Ok(false);
        }
        if !self.is_running() {
            return Err(SharedMemoryError::NotRunning);
        }

        let mut writer = PayloadWriter::new();
        write(&mut writer);
        self.inner.write_now(kind, writer.as_slice())
    }

    /// Reset this side with the next tick and, if connected, tell the peer
    /// to do the same
    pub fn force_reconnect(&self) -> Result<()> {
        if !self.is_running() {
            return Err(SharedMemoryError::NotRunning);
        }
        if self.is_connected() {
            self.inner.notify_peer.store(true, Ordering::SeqCst);
        }
        self.inner.reset_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the tick thread and release the segments
    pub fn dispose(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        info!("Stopping communication...");
        self.inner.stop.store(true, Ordering::SeqCst);
        if thread.join().is_err() {
            error!("Communication thread panicked");
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let config = &self.inner.config;
        if config.unlink_on_dispose {
            for name in [
                config.inbound_segment(self.inner.role),
                config.outbound_segment(self.inner.role),
            ] {
                if let Err(err) = SharedMemoryRegion::unlink(&name, config.backing) {
                    warn!("Failed to unlink segment {}: {}", name, err);
                }
            }
        }
        info!("Communication stopped");
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("role", &self.inner.role)
            .field("channel", &self.inner.config.channel)
            .field("connected", &self.is_connected())
            .field("running", &self.is_running())
            .finish()
    }
}
