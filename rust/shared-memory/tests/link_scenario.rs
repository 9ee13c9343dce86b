//! Two adapters on one channel, host and editor, as two processes would run them

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use studio_link_core::codec::PayloadReader;
use studio_link_core::{AdapterConfig, Backing, MessageKind, Role};
use studio_link_shm::{Adapter, MessageHandler, Outbox, PlatformUtils};

type Inbox = Arc<Mutex<Vec<(MessageKind, Vec<i32>)>>>;

struct Collect {
    inbox: Inbox,
}

impl MessageHandler for Collect {
    fn handle_message(
        &mut self,
        kind: MessageKind,
        reader: &mut PayloadReader<'_>,
        _outbox: &Outbox,
    ) -> studio_link_core::Result<()> {
        self.inbox.lock().push((kind, reader.read()?));
        Ok(())
    }
}

/// Answers every list with its sum
struct Summer;

impl MessageHandler for Summer {
    fn handle_message(
        &mut self,
        kind: MessageKind,
        reader: &mut PayloadReader<'_>,
        outbox: &Outbox,
    ) -> studio_link_core::Result<()> {
        let values: Vec<i32> = reader.read()?;
        outbox.queue(MessageKind(kind.0 + 1), &vec![values.iter().sum::<i32>()]);
        Ok(())
    }
}

fn config() -> AdapterConfig {
    AdapterConfig {
        channel: PlatformUtils::generate_region_name("scenario"),
        backing: Backing::Auto,
        unlink_on_dispose: true,
        ..Default::default()
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_host_and_editor_exchange_messages() {
    let config = config();
    let inbox = Inbox::default();

    let (host, editor) = thread::scope(|scope| {
        let host = scope.spawn(|| Adapter::new(Role::Host, config.clone(), Summer));
        let editor = scope.spawn(|| {
            Adapter::new(
                Role::Editor,
                config.clone(),
                Collect {
                    inbox: Arc::clone(&inbox),
                },
            )
        });
        (host.join().unwrap().unwrap(), editor.join().unwrap().unwrap())
    });

    // Within two ping intervals
    assert!(wait_until(config.ping_interval() * 2, || {
        host.is_connected() && editor.is_connected()
    }));

    host.queue(MessageKind(7), &vec![42i32]);
    assert!(wait_until(Duration::from_secs(1), || !inbox.lock().is_empty()));
    assert_eq!(*inbox.lock(), vec![(MessageKind(7), vec![42])]);

    // Delivered once, not on every tick
    thread::sleep(config.update_rate() * 5);
    assert_eq!(inbox.lock().len(), 1);

    // The host answers from inside its handler
    editor.queue(MessageKind(10), &vec![1i32, 2, 3]);
    assert!(wait_until(Duration::from_secs(1), || inbox.lock().len() == 2));
    assert_eq!(inbox.lock()[1], (MessageKind(11), vec![6]));

    let host_metrics = host.metrics();
    assert_eq!(host_metrics.messages_received, 1);
    assert_eq!(host_metrics.full_resets, 0);
    assert!(host_metrics.pings_sent >= 1);

    editor.dispose();
    host.dispose();
}

#[test]
fn test_messages_in_one_tick_keep_order() {
    let config = config();
    let inbox = Inbox::default();
    let host = Adapter::new(Role::Host, config.clone(), Collect { inbox: Arc::clone(&inbox) }).unwrap();
    let editor = Adapter::new(Role::Editor, config.clone(), Collect { inbox: Inbox::default() }).unwrap();
    assert!(wait_until(config.ping_interval() * 2, || {
        host.is_connected() && editor.is_connected()
    }));

    let outbox = editor.outbox();
    for value in 0..50 {
        outbox.queue(MessageKind(20), &vec![value]);
    }

    assert!(wait_until(Duration::from_secs(1), || inbox.lock().len() == 50));
    let values: Vec<i32> = inbox.lock().iter().map(|(_, v)| v[0]).collect();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_peer_disappearing_disconnects() {
    let config = AdapterConfig {
        ping_interval_ms: 50,
        timeout_delay_ms: 200,
        ..config()
    };
    let host = Adapter::new(Role::Host, config.clone(), Collect { inbox: Inbox::default() }).unwrap();
    let editor = Adapter::new(Role::Editor, config.clone(), Collect { inbox: Inbox::default() }).unwrap();
    assert!(wait_until(Duration::from_secs(1), || host.is_connected()));

    editor.dispose();
    assert!(wait_until(Duration::from_secs(1), || !host.is_connected()));
    thread::sleep(config.timeout_delay() * 2);

    // connected, then disconnected once
    assert_eq!(host.metrics().connection_changes, 2);
}
