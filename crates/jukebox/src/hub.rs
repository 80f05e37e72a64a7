//! Event hub: client registry, command dispatch and lifecycle broadcast.
//!
//! Every registered client gets a reader thread forwarding its messages to one processing
//! loop, and a writer thread draining a bounded outbox. The loop is the only code driving
//! the [`Player`]; it answers rejected commands to the originating client only and
//! broadcasts every player transition to all clients. A client whose outbox stays full is
//! dropped, so a peer that stops reading never stalls the loop.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, select};
use jukebox_player::player::{Player, PlayerSignal};
use jukebox_types::{Event, EventType, StoppedPayload, TrackRequest};

/// Messages queued per client before its writer must catch up.
const OUTBOX_CAPACITY: usize = 256;

/// How long a full outbox may stay full before the client is dropped.
const OUTBOX_STALL: Duration = Duration::from_millis(250);

/// A connected remote peer.
///
/// `read` blocks for one message and reports disconnect as `UnexpectedEof`. `close` must
/// unblock a pending `read` or `write`.
pub trait Client: Send + Sync {
    fn read(&self) -> io::Result<Vec<u8>>;
    fn write(&self, msg: &[u8]) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
}

struct ClientEvent {
    client_id: String,
    raw: Vec<u8>,
}

struct ClientEntry {
    client: Arc<dyn Client>,
    outbox: Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct HubInner {
    clients: Mutex<HashMap<String, ClientEntry>>,
    events_tx: Sender<ClientEvent>,
    /// Reader and writer threads of deregistered clients, joined once they exit.
    retired: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

pub struct EventHub {
    inner: Arc<HubInner>,
    shutdown_tx: Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventHub {
    /// Take ownership of `player` and start the processing loop.
    pub fn spawn(player: Player) -> Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let inner = Arc::new(HubInner {
            clients: Mutex::new(HashMap::new()),
            events_tx,
            retired: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let loop_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("event-hub".to_string())
            .spawn(move || run_loop(player, loop_inner, events_rx, shutdown_rx))
            .context("spawn event hub loop")?;

        Ok(Self {
            inner,
            shutdown_tx,
            loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Register `client` and start its reader and writer. Returns the assigned id.
    pub fn add_client(&self, client: Arc<dyn Client>) -> Result<String> {
        self.inner.reap_retired();

        // Held until the entry is inserted, so a reader failing at once still finds it.
        let mut clients = lock(&self.inner.clients);
        if self.inner.closed.load(Ordering::Acquire) {
            drop(clients);
            let _ = client.close();
            return Err(anyhow!("event hub is closed"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (outbox, outbox_rx) = crossbeam_channel::bounded(OUTBOX_CAPACITY);

        let writer = {
            let inner = self.inner.clone();
            let id = id.clone();
            let client = client.clone();
            std::thread::Builder::new()
                .name("hub-client-tx".to_string())
                .spawn(move || write_loop(inner, id, client, outbox_rx))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                let _ = client.close();
                return Err(e).context("spawn client writer");
            }
        };

        let reader = {
            let inner = self.inner.clone();
            let id = id.clone();
            let client = client.clone();
            std::thread::Builder::new()
                .name("hub-client-rx".to_string())
                .spawn(move || read_loop(inner, id, client))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                // Dropping the outbox sender ends the writer.
                let _ = client.close();
                lock(&self.inner.retired).push(writer);
                return Err(e).context("spawn client reader");
            }
        };

        clients.insert(
            id.clone(),
            ClientEntry {
                client,
                outbox,
                reader,
                writer,
            },
        );
        tracing::info!(client_id = %id, clients = clients.len(), "client connected");
        Ok(id)
    }

    /// Deregister a client and close its transport. Playback is not affected.
    pub fn del_client(&self, id: &str) -> bool {
        match self.inner.remove_client(id) {
            Some(client) => {
                let _ = client.close();
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        lock(&self.inner.clients).len()
    }

    /// Queue `event` for every registered client.
    pub fn broadcast(&self, event: &Event) {
        self.inner.broadcast(event);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut down: stop the player, close every client and join all threads. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = lock(&self.loop_handle).take() {
            if handle.join().is_err() {
                tracing::error!("event hub loop panicked");
            }
        }

        let entries: Vec<(String, ClientEntry)> = lock(&self.inner.clients).drain().collect();
        let mut threads = std::mem::take(&mut *lock(&self.inner.retired));
        let mut clients = Vec::with_capacity(entries.len());
        let mut writers = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            // Writers exit once their outbox is empty and its sender is gone.
            drop(entry.outbox);
            clients.push((id, entry.client));
            threads.push(entry.reader);
            writers.push(entry.writer);
        }

        // Let queued events, the final `player:stopped` among them, reach the clients.
        let deadline = Instant::now() + OUTBOX_STALL;
        while writers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        for (id, client) in clients {
            if let Err(e) = client.close() {
                tracing::debug!(client_id = %id, "client close failed: {e}");
            }
        }
        threads.extend(writers);

        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("client thread panicked");
            }
        }
        tracing::info!("event hub closed");
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        self.close();
    }
}

impl HubInner {
    /// Remove a client from the registry. Its outbox is dropped, which ends its writer.
    fn remove_client(&self, id: &str) -> Option<Arc<dyn Client>> {
        let mut clients = lock(&self.clients);
        let entry = clients.remove(id)?;
        tracing::info!(client_id = %id, clients = clients.len(), "client removed");
        drop(clients);
        lock(&self.retired).extend([entry.reader, entry.writer]);
        Some(entry.client)
    }

    /// Join retired client threads that have already exited.
    fn reap_retired(&self) {
        let mut retired = lock(&self.retired);
        let (done, running): (Vec<_>, Vec<_>) =
            retired.drain(..).partition(|handle| handle.is_finished());
        *retired = running;
        drop(retired);
        for handle in done {
            if handle.join().is_err() {
                tracing::error!("client thread panicked");
            }
        }
    }

    fn broadcast(&self, event: &Event) {
        let Some(bytes) = encode(event) else {
            return;
        };
        let targets: Vec<(String, Sender<Vec<u8>>)> = {
            let clients = lock(&self.clients);
            clients
                .iter()
                .map(|(id, entry)| (id.clone(), entry.outbox.clone()))
                .collect()
        };
        tracing::debug!(kind = %event.kind, clients = targets.len(), "broadcast");
        for (id, outbox) in targets {
            self.enqueue(&id, &outbox, bytes.clone());
        }
    }

    fn send_to(&self, id: &str, event: &Event) {
        let Some(bytes) = encode(event) else {
            return;
        };
        let outbox = lock(&self.clients).get(id).map(|entry| entry.outbox.clone());
        match outbox {
            Some(outbox) => self.enqueue(id, &outbox, bytes),
            None => tracing::debug!(client_id = %id, "reply dropped; client is gone"),
        }
    }

    fn enqueue(&self, id: &str, outbox: &Sender<Vec<u8>>, bytes: Vec<u8>) {
        match outbox.send_timeout(bytes, OUTBOX_STALL) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(client_id = %id, "client is not reading; dropping it");
                if let Some(client) = self.remove_client(id) {
                    let _ = client.close();
                }
            }
            // Writer already gone; its client is being removed.
            Err(SendTimeoutError::Disconnected(_)) => {}
        }
    }

    fn send_error(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(client_id = %id, error = %message, "command rejected");
        self.send_to(id, &Event::error(message));
    }
}

fn encode(event: &Event) -> Option<Vec<u8>> {
    match event.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(kind = %event.kind, "encode event failed: {e}");
            None
        }
    }
}

/// Recover the guard from a poisoned lock; the protected maps stay consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_loop(inner: Arc<HubInner>, id: String, client: Arc<dyn Client>) {
    loop {
        match client.read() {
            Ok(raw) => {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                let event = ClientEvent {
                    client_id: id.clone(),
                    raw,
                };
                if inner.events_tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(client_id = %id, "client disconnected");
                break;
            }
            Err(e) => {
                if !inner.closed.load(Ordering::Acquire) {
                    tracing::warn!(client_id = %id, "client read failed: {e}");
                }
                break;
            }
        }
    }
    if inner.remove_client(&id).is_some() {
        let _ = client.close();
    }
}

fn write_loop(
    inner: Arc<HubInner>,
    id: String,
    client: Arc<dyn Client>,
    outbox: Receiver<Vec<u8>>,
) {
    for msg in outbox.iter() {
        if let Err(e) = client.write(&msg) {
            if !inner.closed.load(Ordering::Acquire) {
                tracing::warn!(client_id = %id, "client write failed: {e}");
            }
            break;
        }
    }
    if inner.remove_client(&id).is_some() {
        let _ = client.close();
    }
}

fn run_loop(
    mut player: Player,
    inner: Arc<HubInner>,
    events_rx: Receiver<ClientEvent>,
    shutdown_rx: Receiver<()>,
) {
    let signals = player.signals();
    loop {
        let session_end = player
            .session_end()
            .unwrap_or_else(crossbeam_channel::never);
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(events_rx) -> msg => match msg {
                Ok(event) => handle_client_event(&mut player, &inner, event),
                Err(_) => break,
            },
            recv(session_end) -> outcome => {
                if let Ok(outcome) = outcome {
                    player.finish_session(outcome);
                }
            },
            recv(signals) -> signal => {
                if let Ok(signal) = signal {
                    broadcast_signal(&inner, signal);
                }
            },
        }
        // Flush transitions right away so broadcasts keep transition order.
        for signal in signals.try_iter() {
            broadcast_signal(&inner, signal);
        }
    }

    player.close();
    for signal in signals.try_iter() {
        broadcast_signal(&inner, signal);
    }
    tracing::debug!("event hub loop exited");
}

fn handle_client_event(player: &mut Player, inner: &HubInner, event: ClientEvent) {
    let ClientEvent { client_id, raw } = event;
    let event = match Event::from_slice(&raw) {
        Ok(event) => event,
        Err(e) => {
            inner.send_error(&client_id, format!("invalid event: {e}"));
            return;
        }
    };
    tracing::debug!(client_id = %client_id, kind = %event.kind, "command received");

    match event.kind {
        EventType::Play => match event.payload_as::<TrackRequest>() {
            Ok(request) => {
                if let Err(e) = player.play(request) {
                    inner.send_error(&client_id, e.to_string());
                }
            }
            Err(e) => inner.send_error(&client_id, format!("invalid play payload: {e}")),
        },
        EventType::Pause => {
            if !player.pause() {
                inner.send_error(&client_id, "cannot pause");
            }
        }
        EventType::Resume => {
            if !player.resume() {
                inner.send_error(&client_id, "cannot resume");
            }
        }
        EventType::Stop => {
            if !player.stop() {
                inner.send_error(&client_id, "cannot stop");
            }
        }
        other => inner.send_error(&client_id, format!("unsupported event type: {other}")),
    }
}

fn broadcast_signal(inner: &HubInner, signal: PlayerSignal) {
    let event = match signal {
        PlayerSignal::Playing(request) => Event::with_payload(EventType::Playing, &request),
        PlayerSignal::Paused => Ok(Event::new(EventType::Paused)),
        PlayerSignal::Resumed => Ok(Event::new(EventType::Resumed)),
        PlayerSignal::Stopped { reason, error } => {
            Event::with_payload(EventType::Stopped, &StoppedPayload { reason, error })
        }
    };
    match event {
        Ok(event) => inner.broadcast(&event),
        Err(e) => tracing::error!("encode player signal failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_player::config::PlaybackConfig;
    use jukebox_player::provider::{Provider, ProviderRegistry, TrackStream};
    use jukebox_player::sink::{AudioSink, SinkReader};
    use jukebox_types::{ErrorPayload, StopReason};
    use std::io::Cursor;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(150);

    /// In-memory client: the test side talks to it through a [`Peer`].
    struct FakeClient {
        inbound: Receiver<Vec<u8>>,
        outbound: Sender<Vec<u8>>,
        close_tx: Mutex<Option<Sender<()>>>,
        close_rx: Receiver<()>,
    }

    impl Client for FakeClient {
        fn read(&self) -> io::Result<Vec<u8>> {
            let eof = || io::Error::from(io::ErrorKind::UnexpectedEof);
            select! {
                recv(self.inbound) -> msg => msg.map_err(|_| eof()),
                recv(self.close_rx) -> _ => Err(eof()),
            }
        }

        /// Blocks while the outbound channel is full, until the client is closed.
        fn write(&self, msg: &[u8]) -> io::Result<usize> {
            let broken = || io::Error::from(io::ErrorKind::BrokenPipe);
            select! {
                send(self.outbound, msg.to_vec()) -> sent => sent.map_err(|_| broken())?,
                recv(self.close_rx) -> _ => return Err(broken()),
            }
            Ok(msg.len())
        }

        fn close(&self) -> io::Result<()> {
            lock(&self.close_tx).take();
            Ok(())
        }
    }

    struct Peer {
        id: String,
        tx: Option<Sender<Vec<u8>>>,
        rx: Receiver<Vec<u8>>,
    }

    impl Peer {
        fn send(&self, kind: EventType) {
            self.send_raw(Event::new(kind).to_bytes().unwrap());
        }

        fn play(&self, provider: &str, track: &str) {
            let request = TrackRequest::new(provider, track);
            let event = Event::with_payload(EventType::Play, &request).unwrap();
            self.send_raw(event.to_bytes().unwrap());
        }

        fn send_raw(&self, raw: Vec<u8>) {
            self.tx.as_ref().unwrap().send(raw).unwrap();
        }

        fn recv(&self) -> Event {
            let raw = self.rx.recv_timeout(WAIT).expect("no event received");
            Event::from_slice(&raw).unwrap()
        }

        fn expect(&self, kind: EventType) -> Event {
            let event = self.recv();
            assert_eq!(event.kind, kind, "unexpected event {event:?}");
            event
        }

        fn expect_error(&self) -> String {
            self.expect(EventType::Error)
                .payload_as::<ErrorPayload>()
                .unwrap()
                .error
        }

        fn expect_quiet(&self) {
            if let Ok(raw) = self.rx.recv_timeout(QUIET) {
                panic!("unexpected event {}", String::from_utf8_lossy(&raw));
            }
        }

        fn disconnect(&mut self) {
            self.tx.take();
        }
    }

    struct Endless;

    impl Provider for Endless {
        fn name(&self) -> &str {
            "endless"
        }

        fn stream(&self, _track_id: &str) -> anyhow::Result<TrackStream> {
            Ok(Box::new(io::repeat(0)))
        }
    }

    struct Short;

    impl Provider for Short {
        fn name(&self) -> &str {
            "short"
        }

        fn stream(&self, _track_id: &str) -> anyhow::Result<TrackStream> {
            Ok(Box::new(Cursor::new(vec![0u8; 256])))
        }
    }

    struct Fixture {
        hub: EventHub,
        _reader: SinkReader,
    }

    fn fixture() -> Fixture {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(Endless));
        providers.register(Arc::new(Short));
        let (sink, reader) = AudioSink::new(4);
        let config = PlaybackConfig {
            frames_per_buffer: 64,
            retry_backoff: Duration::from_millis(2),
            ..PlaybackConfig::default()
        };
        let player = Player::new(providers, sink, config);
        Fixture {
            hub: EventHub::spawn(player).unwrap(),
            _reader: reader,
        }
    }

    fn connect(hub: &EventHub) -> Peer {
        connect_with(hub, crossbeam_channel::unbounded())
    }

    /// A peer that never reads: every write blocks until the client is closed.
    fn connect_stalled(hub: &EventHub) -> Peer {
        connect_with(hub, crossbeam_channel::bounded(0))
    }

    fn connect_with(
        hub: &EventHub,
        (out_tx, out_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    ) -> Peer {
        let (in_tx, in_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(1);
        let client = FakeClient {
            inbound: in_rx,
            outbound: out_tx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        };
        let id = hub.add_client(Arc::new(client)).unwrap();
        Peer {
            id,
            tx: Some(in_tx),
            rx: out_rx,
        }
    }

    fn stop_reason(event: &Event) -> StopReason {
        event.payload_as::<StoppedPayload>().unwrap().reason
    }

    #[test]
    fn play_lifecycle_is_broadcast_to_every_client() {
        let f = fixture();
        let a = connect(&f.hub);
        let b = connect(&f.hub);

        a.play("endless", "T1");
        for peer in [&a, &b] {
            let event = peer.expect(EventType::Playing);
            let track: TrackRequest = event.payload_as().unwrap();
            assert_eq!(track.provider_track_id, "T1");
        }

        b.send(EventType::Pause);
        a.expect(EventType::Paused);
        b.expect(EventType::Paused);

        a.send(EventType::Resume);
        a.expect(EventType::Resumed);
        b.expect(EventType::Resumed);

        a.send(EventType::Stop);
        assert_eq!(stop_reason(&a.expect(EventType::Stopped)), StopReason::Stopped);
        assert_eq!(stop_reason(&b.expect(EventType::Stopped)), StopReason::Stopped);

        // Idle again: a second stop is rejected, a new play succeeds.
        a.send(EventType::Stop);
        assert_eq!(a.expect_error(), "cannot stop");
        b.expect_quiet();
        b.play("endless", "T2");
        a.expect(EventType::Playing);
        b.expect(EventType::Playing);
    }

    #[test]
    fn rejected_commands_reach_only_the_originator() {
        let f = fixture();
        let a = connect(&f.hub);
        let b = connect(&f.hub);

        a.send(EventType::Pause);
        assert_eq!(a.expect_error(), "cannot pause");
        a.send(EventType::Resume);
        assert_eq!(a.expect_error(), "cannot resume");
        b.expect_quiet();

        a.play("endless", "T1");
        a.expect(EventType::Playing);
        b.expect(EventType::Playing);
        b.play("endless", "T2");
        assert_eq!(b.expect_error(), "player is playing");
        b.send(EventType::Resume);
        assert_eq!(b.expect_error(), "cannot resume");
        a.expect_quiet();
    }

    #[test]
    fn unknown_provider_errors_only_to_originator() {
        let f = fixture();
        let a = connect(&f.hub);
        let b = connect(&f.hub);

        a.play("nosuch", "T1");
        assert!(a.expect_error().contains("unknown provider"));
        b.expect_quiet();

        // Still idle.
        b.send(EventType::Stop);
        assert_eq!(b.expect_error(), "cannot stop");
    }

    #[test]
    fn malformed_messages_get_an_error_reply() {
        let f = fixture();
        let a = connect(&f.hub);

        a.send_raw(b"not json".to_vec());
        assert!(a.expect_error().starts_with("invalid event"));

        a.send_raw(br#"{"type":"play","created":"2016-05-01T10:00:00Z"}"#.to_vec());
        assert!(a.expect_error().starts_with("invalid play payload"));

        a.send(EventType::Playing);
        assert_eq!(a.expect_error(), "unsupported event type: player:playing");
    }

    #[test]
    fn finished_track_broadcasts_stopped_finished() {
        let f = fixture();
        let a = connect(&f.hub);
        let b = connect(&f.hub);

        a.play("short", "T1");
        a.expect(EventType::Playing);
        b.expect(EventType::Playing);
        assert_eq!(stop_reason(&a.expect(EventType::Stopped)), StopReason::Finished);
        assert_eq!(stop_reason(&b.expect(EventType::Stopped)), StopReason::Finished);

        b.play("short", "T2");
        a.expect(EventType::Playing);
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn disconnect_during_playback_keeps_playing() {
        let f = fixture();
        let mut a = connect(&f.hub);
        let b = connect(&f.hub);

        a.play("endless", "T1");
        a.expect(EventType::Playing);
        b.expect(EventType::Playing);

        // The client that started the track goes away.
        a.disconnect();
        wait_until("deregistration", || f.hub.client_count() == 1);

        b.send(EventType::Pause);
        b.expect(EventType::Paused);
        b.send(EventType::Resume);
        b.expect(EventType::Resumed);
    }

    #[test]
    fn stalled_client_is_dropped_without_blocking_others() {
        let f = fixture();
        let healthy = connect(&f.hub);
        let stalled = connect_stalled(&f.hub);

        let total = OUTBOX_CAPACITY * 4;
        for _ in 0..total {
            f.hub.broadcast(&Event::new(EventType::Paused));
        }
        for _ in 0..total {
            healthy.expect(EventType::Paused);
        }
        assert_eq!(f.hub.client_count(), 1);

        // The loop still answers commands.
        healthy.send(EventType::Stop);
        assert_eq!(healthy.expect_error(), "cannot stop");

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let hub = f.hub;
        std::thread::spawn(move || {
            hub.close();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(WAIT).is_ok(), "close did not return");
        drop(stalled);
    }

    #[test]
    fn finished_client_threads_are_reaped() {
        let f = fixture();
        for _ in 0..50 {
            let mut peer = connect(&f.hub);
            peer.disconnect();
        }
        wait_until("deregistration", || f.hub.client_count() == 0);
        wait_until("client threads to be joined", || {
            f.hub.inner.reap_retired();
            lock(&f.hub.inner.retired).is_empty()
        });

        // Still serving new clients afterwards.
        let a = connect(&f.hub);
        a.send(EventType::Pause);
        assert_eq!(a.expect_error(), "cannot pause");
    }

    #[test]
    fn del_client_stops_delivery() {
        let f = fixture();
        let a = connect(&f.hub);
        let b = connect(&f.hub);

        assert!(f.hub.del_client(&b.id));
        assert!(!f.hub.del_client(&b.id));
        assert_eq!(f.hub.client_count(), 1);

        f.hub.broadcast(&Event::new(EventType::Paused));
        a.expect(EventType::Paused);
        b.expect_quiet();
    }

    #[test]
    fn concurrent_plays_start_exactly_one_track() {
        let f = fixture();
        let peers: Vec<Peer> = (0..6).map(|_| connect(&f.hub)).collect();
        for (i, peer) in peers.iter().enumerate() {
            peer.play("endless", &format!("T{i}"));
        }

        let mut errors = 0;
        for peer in &peers {
            // Every peer sees the one broadcast; losers also see their own error.
            let mut playing = 0;
            while let Ok(raw) = peer.rx.recv_timeout(QUIET * 2) {
                match Event::from_slice(&raw).unwrap().kind {
                    EventType::Playing => playing += 1,
                    EventType::Error => errors += 1,
                    other => panic!("unexpected {other}"),
                }
            }
            assert_eq!(playing, 1);
        }
        assert_eq!(errors, peers.len() - 1);
    }

    #[test]
    fn close_stops_playback_and_closes_clients() {
        let f = fixture();
        let a = connect(&f.hub);

        a.play("endless", "T1");
        a.expect(EventType::Playing);

        f.hub.close();
        f.hub.close();
        assert!(f.hub.is_closed());
        assert_eq!(stop_reason(&a.expect(EventType::Stopped)), StopReason::Stopped);
        assert_eq!(f.hub.client_count(), 0);

        let (_in_tx, in_rx) = crossbeam_channel::unbounded();
        let (out_tx, _out_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(1);
        let late = Arc::new(FakeClient {
            inbound: in_rx,
            outbound: out_tx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        });
        assert!(f.hub.add_client(late.clone()).is_err());
        assert!(lock(&late.close_tx).is_none());
    }
}
