//! [`BridgeServer`] – TCP fan-out of telemetry and fan-in of commands.
//!
//! Listens on `0.0.0.0:8765` by default (configurable via
//! [`BridgeServerConfig::with_addr`] / [`BridgeServerConfig::with_port`]).
//!
//! ```text
//!  BridgeIngest ──┐                          ┌─▶ OutboundQueue ─▶ writer task ─▶ client 1
//!  (samples)      ├─▶ broadcast stage ───────┼─▶ OutboundQueue ─▶ writer task ─▶ client 2
//!  reader tasks ──┘   (seq, registry,        └─▶ …
//!  (commands)          CommandSink)
//! ```
//!
//! The broadcast stage is the only place that assigns sequence numbers and
//! the only owner of the client registry, so every client observes frames
//! in the same relative order.  A slow client loses its oldest frames; it
//! never slows the stage down.
//!
//! Per connection: `Connecting → Active → Draining → Closed`.  A clean
//! disconnect (EOF) drains the queue for up to the drain timeout; a socket
//! error closes immediately.  Only [`BridgeServer::bind`] can fail fatally.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axon_types::wire::notice_line;
use axon_types::{
    AxonError, CalibratedSample, CalibrationStatus, Command, CommandSink, SensorSample,
    TelemetryFrame, TelemetrySink,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lines::{LineEvent, LineReader};
use crate::queue::{OutboundQueue, PushOutcome};

/// Default TCP port of the bridge.
pub const DEFAULT_PORT: u16 = 8765;

/// Origin id used for commands typed at the local operator console.
pub const LOCAL_CLIENT_ID: u64 = 0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeServerConfig {
    pub bind_addr: SocketAddr,
    /// Frames buffered per client before the oldest is dropped.
    pub queue_capacity: usize,
    /// Consecutive drops after which a client is disconnected.
    pub max_consecutive_drops: u64,
    pub write_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_line_bytes: usize,
    /// Sent to every client as a `#` notice line on connect.
    pub welcome: Option<String>,
    pub ingest_capacity: usize,
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            queue_capacity: 64,
            max_consecutive_drops: 256,
            write_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            max_line_bytes: 1024,
            welcome: Some("Axon serial bridge ready".to_string()),
            ingest_capacity: 1024,
        }
    }
}

impl BridgeServerConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_welcome(mut self, welcome: Option<String>) -> Self {
        self.welcome = welcome;
        self
    }
}

// ---------------------------------------------------------------------------
// Per-client shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Diagnostics for one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub client_id: u64,
    pub peer: SocketAddr,
    pub state: ConnectionState,
    pub queued: usize,
    pub dropped: u64,
}

#[derive(Debug)]
struct ClientShared {
    id: u64,
    peer: SocketAddr,
    queue: OutboundQueue,
    state: Mutex<ConnectionState>,
}

impl ClientShared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            client_id: self.id,
            peer: self.peer,
            state: *self.state.lock(),
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast stage
// ---------------------------------------------------------------------------

enum StageMessage {
    Sample {
        status: CalibrationStatus,
        sample: SensorSample,
    },
    Command {
        client_id: u64,
        raw_text: String,
        received_at: DateTime<Utc>,
    },
    Register(Arc<ClientShared>),
    Unregister(u64),
    Snapshot(oneshot::Sender<Vec<ClientStats>>),
    Shutdown,
}

struct BroadcastStage {
    next_seq: u64,
    clients: BTreeMap<u64, Arc<ClientShared>>,
    commands: Arc<dyn CommandSink>,
}

impl BroadcastStage {
    async fn run(mut self, mut rx: mpsc::Receiver<StageMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                StageMessage::Sample { status, sample } => {
                    let seq = self.take_seq();
                    self.broadcast(TelemetryFrame::Telemetry {
                        seq,
                        status,
                        sample,
                    });
                }
                StageMessage::Command {
                    client_id,
                    raw_text,
                    received_at,
                } => {
                    let command = Command {
                        sequence_id: self.take_seq(),
                        origin_client_id: client_id,
                        raw_text,
                        received_at,
                    };
                    self.handle_command(command);
                }
                StageMessage::Register(client) => {
                    self.clients.insert(client.id, client);
                }
                StageMessage::Unregister(id) => {
                    self.clients.remove(&id);
                }
                StageMessage::Snapshot(reply) => {
                    let stats = self.clients.values().map(|c| c.stats()).collect();
                    let _ = reply.send(stats);
                }
                StageMessage::Shutdown => break,
            }
        }

        for client in self.clients.values() {
            client.queue.begin_drain();
        }
        debug!("broadcast stage stopped");
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn handle_command(&mut self, command: Command) {
        info!(
            seq = command.sequence_id,
            client_id = command.origin_client_id,
            command = %command.raw_text,
            "command received"
        );
        if let Err(e) = self.commands.send_command(&command.raw_text) {
            warn!(seq = command.sequence_id, error = %e, "command forward failed; echoing anyway");
        }
        self.broadcast(TelemetryFrame::CommandEcho {
            seq: command.sequence_id,
            client_id: command.origin_client_id,
            raw_text: command.raw_text,
        });
    }

    fn broadcast(&mut self, frame: TelemetryFrame) {
        let line: Arc<str> = match frame.encode() {
            Ok(line) => Arc::from(line),
            Err(e) => {
                warn!(seq = frame.seq(), error = %e, "frame encoding failed; skipped");
                return;
            }
        };

        let mut overflowed = Vec::new();
        for (id, client) in &self.clients {
            match client.queue.push(Arc::clone(&line)) {
                PushOutcome::Queued | PushOutcome::Closed => {}
                PushOutcome::DroppedOldest => {
                    debug!(client_id = id, dropped = client.queue.dropped(), "slow client; oldest frame dropped");
                }
                PushOutcome::Overflow => {
                    let error = AxonError::ClientOverflow {
                        client_id: *id,
                        dropped: client.queue.dropped(),
                    };
                    warn!(peer = %client.peer, error = %error, "disconnecting slow client");
                    overflowed.push(*id);
                }
            }
        }
        for id in overflowed {
            self.clients.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Non-blocking entry point into the broadcast stage.
#[derive(Clone)]
pub struct BridgeIngest {
    stage: mpsc::Sender<StageMessage>,
    dropped: Arc<AtomicU64>,
}

impl BridgeIngest {
    /// Forward and echo a command typed at the local console.
    pub fn submit_local_command(&self, raw_text: &str) -> Result<(), AxonError> {
        let raw_text = raw_text.trim();
        if raw_text.is_empty() {
            return Ok(());
        }
        self.stage
            .try_send(StageMessage::Command {
                client_id: LOCAL_CLIENT_ID,
                raw_text: raw_text.to_string(),
                received_at: Utc::now(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    AxonError::Protocol("bridge is busy; command not accepted".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => AxonError::NotConnected,
            })
    }

    /// Samples discarded because the stage was saturated.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for BridgeIngest {
    fn publish(&self, sample: &CalibratedSample) {
        let message = StageMessage::Sample {
            status: sample.status,
            sample: sample.raw.clone(),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.stage.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeServer
// ---------------------------------------------------------------------------

/// A bound, not yet running bridge.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use axon_bridge::{BridgeServer, BridgeServerConfig};
/// use axon_types::{AxonError, CommandSink};
///
/// struct Discard;
/// impl CommandSink for Discard {
///     fn send_command(&self, _raw_text: &str) -> Result<(), AxonError> { Ok(()) }
/// }
///
/// # async fn run() -> Result<(), AxonError> {
/// let server = BridgeServer::bind(BridgeServerConfig::default(), Arc::new(Discard)).await?;
/// let handle = server.spawn();
/// let ingest = handle.ingest();
/// # Ok(())
/// # }
/// ```
pub struct BridgeServer {
    listener: TcpListener,
    config: BridgeServerConfig,
    commands: Arc<dyn CommandSink>,
}

impl BridgeServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`AxonError::BindFailure`] when the address cannot be bound.
    pub async fn bind(
        config: BridgeServerConfig,
        commands: Arc<dyn CommandSink>,
    ) -> Result<Self, AxonError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            AxonError::BindFailure {
                addr: config.bind_addr.to_string(),
                details: e.to_string(),
            }
        })?;
        Ok(Self {
            listener,
            config,
            commands,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AxonError> {
        self.listener
            .local_addr()
            .map_err(|e| AxonError::Config(format!("listener address unavailable: {e}")))
    }

    /// Start the broadcast stage and the accept loop.
    pub fn spawn(self) -> BridgeHandle {
        let local_addr = self
            .listener
            .local_addr()
            .unwrap_or(self.config.bind_addr);
        info!(addr = %local_addr, "bridge listening");

        let (stage_tx, stage_rx) = mpsc::channel(self.config.ingest_capacity.max(1));
        let stage = BroadcastStage {
            next_seq: 0,
            clients: BTreeMap::new(),
            commands: self.commands,
        };
        let stage_task = tokio::spawn(stage.run(stage_rx));
        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            Arc::new(self.config),
            stage_tx.clone(),
        ));

        BridgeHandle {
            stage: stage_tx,
            dropped: Arc::new(AtomicU64::new(0)),
            local_addr,
            accept_task,
            stage_task,
        }
    }
}

/// Control surface of a running bridge.
pub struct BridgeHandle {
    stage: mpsc::Sender<StageMessage>,
    dropped: Arc<AtomicU64>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    stage_task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn ingest(&self) -> BridgeIngest {
        BridgeIngest {
            stage: self.stage.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn client_stats(&self) -> Result<Vec<ClientStats>, AxonError> {
        let (tx, rx) = oneshot::channel();
        self.stage
            .send(StageMessage::Snapshot(tx))
            .await
            .map_err(|_| AxonError::NotConnected)?;
        rx.await.map_err(|_| AxonError::NotConnected)
    }

    /// Stop accepting, drain every client, and wait for the stage to stop.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let _ = self.stage.send(StageMessage::Shutdown).await;
        let _ = self.stage_task.await;
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    config: Arc<BridgeServerConfig>,
    stage: mpsc::Sender<StageMessage>,
) {
    let mut next_id = LOCAL_CLIENT_ID + 1;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = next_id;
                next_id += 1;
                tokio::spawn(serve_client(
                    id,
                    stream,
                    peer,
                    Arc::clone(&config),
                    stage.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "bridge accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

enum ReadOutcome {
    Eof,
    Failed(String),
    WriterStopped,
    StageStopped,
}

async fn serve_client(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<BridgeServerConfig>,
    stage: mpsc::Sender<StageMessage>,
) {
    let client = Arc::new(ClientShared {
        id,
        peer,
        queue: OutboundQueue::new(config.queue_capacity, config.max_consecutive_drops),
        state: Mutex::new(ConnectionState::Connecting),
    });
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client_id = id, error = %e, "set_nodelay failed");
    }
    if let Some(welcome) = &config.welcome {
        client.queue.push(Arc::from(notice_line(welcome)));
    }
    if stage.send(StageMessage::Register(Arc::clone(&client))).await.is_err() {
        return;
    }
    client.set_state(ConnectionState::Active);
    info!(client_id = id, peer = %peer, "bridge client connected");

    let (read_half, write_half) = stream.into_split();
    let mut writer = tokio::spawn(write_frames(
        Arc::clone(&client),
        write_half,
        config.write_timeout,
    ));

    let outcome = tokio::select! {
        outcome = read_commands(id, read_half, &stage, config.max_line_bytes) => outcome,
        _ = &mut writer => ReadOutcome::WriterStopped,
    };

    match outcome {
        ReadOutcome::Eof | ReadOutcome::StageStopped => {
            client.set_state(ConnectionState::Draining);
            client.queue.begin_drain();
            if tokio::time::timeout(config.drain_timeout, &mut writer)
                .await
                .is_err()
            {
                debug!(client_id = id, "drain timed out");
                writer.abort();
            }
        }
        ReadOutcome::Failed(reason) => {
            debug!(client_id = id, reason = %reason, "client read failed");
            client.queue.close();
            writer.abort();
        }
        ReadOutcome::WriterStopped => client.queue.close(),
    }

    let _ = stage.send(StageMessage::Unregister(id)).await;
    client.set_state(ConnectionState::Closed);
    info!(
        client_id = id,
        peer = %peer,
        dropped = client.queue.dropped(),
        "bridge client disconnected"
    );
}

async fn read_commands(
    id: u64,
    read_half: tokio::net::tcp::OwnedReadHalf,
    stage: &mpsc::Sender<StageMessage>,
    max_line_bytes: usize,
) -> ReadOutcome {
    let mut lines = LineReader::new(read_half, max_line_bytes);
    loop {
        match lines.next_line().await {
            Ok(None) => return ReadOutcome::Eof,
            Ok(Some(LineEvent::TooLong)) => {
                warn!(client_id = id, limit = max_line_bytes, "over-long command line discarded");
            }
            Ok(Some(LineEvent::Line(line))) => {
                let raw_text = line.trim();
                if raw_text.is_empty() {
                    continue;
                }
                let message = StageMessage::Command {
                    client_id: id,
                    raw_text: raw_text.to_string(),
                    received_at: Utc::now(),
                };
                if stage.send(message).await.is_err() {
                    return ReadOutcome::StageStopped;
                }
            }
            Err(e) => return ReadOutcome::Failed(e.to_string()),
        }
    }
}

/// A write stuck on a stalled peer is abandoned as soon as the queue closes
/// (overflow), not only when the write timeout expires.
async fn write_frames(client: Arc<ClientShared>, mut writer: OwnedWriteHalf, timeout: Duration) {
    while let Some(line) = client.queue.pop().await {
        let written = tokio::select! {
            written = tokio::time::timeout(timeout, writer.write_all(line.as_bytes())) => written,
            _ = client.queue.closed() => {
                debug!(client_id = client.id, "queue closed during a write");
                break;
            }
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = client.id, error = %e, "client write failed");
                break;
            }
            Err(_) => {
                warn!(client_id = client.id, peer = %client.peer, "client write timed out; closing");
                break;
            }
        }
    }
    client.queue.close();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use axon_types::{SampleSource, SensorReading, Vec3};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        commands: Mutex<Vec<String>>,
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, raw_text: &str) -> Result<(), AxonError> {
            self.commands.lock().push(raw_text.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    impl CommandSink for FailingSink {
        fn send_command(&self, _raw_text: &str) -> Result<(), AxonError> {
            Err(AxonError::NotConnected)
        }
    }

    fn local_config() -> BridgeServerConfig {
        BridgeServerConfig::default().with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    async fn start(sink: Arc<dyn CommandSink>) -> BridgeHandle {
        BridgeServer::bind(local_config(), sink).await.unwrap().spawn()
    }

    struct TestClient {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            let mut client = Self {
                lines: BufReader::new(read).lines(),
                writer,
            };
            let welcome = client.next_line().await;
            assert_eq!(welcome, "# Axon serial bridge ready");
            client
        }

        async fn next_line(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }

        async fn next_frame(&mut self) -> TelemetryFrame {
            TelemetryFrame::parse(&self.next_line().await).unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    async fn wait_for_clients(handle: &BridgeHandle, count: usize) {
        for _ in 0..200 {
            if handle.client_stats().await.unwrap().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} clients");
    }

    fn calibrated(timestamp_us: u64) -> CalibratedSample {
        let raw = SensorSample::new(
            timestamp_us,
            SampleSource::Simulated,
            SensorReading {
                accel: Vec3::new(0.0, 0.0, 1.0),
                gyro: Vec3::new(0.9, 0.9, 0.9),
                battery_voltage: 12.0,
                battery_percent: 90.0,
                link_quality: 100,
            },
        );
        CalibratedSample {
            gyro: raw.gyro(),
            raw,
            status: CalibrationStatus::Uncalibrated,
        }
    }

    #[tokio::test]
    async fn command_is_forwarded_and_echoed_to_every_client() {
        let sink = Arc::new(RecordingSink::default());
        let handle = start(sink.clone()).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        let mut b = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 2).await;

        a.send("LED ON\n").await;

        let echo_a = a.next_frame().await;
        let echo_b = b.next_frame().await;
        assert_eq!(echo_a, echo_b);
        match echo_a {
            TelemetryFrame::CommandEcho { raw_text, .. } => assert_eq!(raw_text, "LED ON"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(*sink.commands.lock(), vec!["LED ON".to_string()]);
    }

    #[tokio::test]
    async fn every_client_sees_increasing_sequence_numbers() {
        let handle = start(Arc::new(RecordingSink::default())).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        let mut b = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 2).await;

        let ingest = handle.ingest();
        for i in 0..20 {
            ingest.publish(&calibrated(i * 20_000));
            if i == 10 {
                ingest.submit_local_command("BEEP").unwrap();
            }
        }

        for client in [&mut a, &mut b] {
            let mut seqs = Vec::new();
            for _ in 0..21 {
                seqs.push(client.next_frame().await.seq());
            }
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs {seqs:?}");
        }
    }

    #[tokio::test]
    async fn forward_failure_still_echoes() {
        let handle = start(Arc::new(FailingSink)).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 1).await;

        a.send("LED ON\n").await;
        assert!(matches!(
            a.next_frame().await,
            TelemetryFrame::CommandEcho { .. }
        ));
    }

    #[tokio::test]
    async fn over_long_and_blank_lines_are_not_commands() {
        let sink = Arc::new(RecordingSink::default());
        let handle = start(sink.clone()).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 1).await;

        let mut junk = "x".repeat(4096);
        junk.push_str("\n   \nPING\n");
        a.send(&junk).await;

        match a.next_frame().await {
            TelemetryFrame::CommandEcho { raw_text, .. } => assert_eq!(raw_text, "PING"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(*sink.commands.lock(), vec!["PING".to_string()]);
    }

    #[tokio::test]
    async fn disconnected_clients_leave_the_registry() {
        let handle = start(Arc::new(RecordingSink::default())).await;
        let a = TestClient::connect(handle.local_addr()).await;
        let _b = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 2).await;

        drop(a);
        wait_for_clients(&handle, 1).await;
        let stats = handle.client_stats().await.unwrap();
        assert_eq!(stats[0].state, ConnectionState::Active);
    }

    /// A peer that never reads, with a tiny receive window.
    async fn stalled_client(addr: SocketAddr) -> TcpStream {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.connect(addr).await.unwrap()
    }

    /// Counts every line a well-behaved client receives.
    fn spawn_counting_reader(client: TestClient) -> (Arc<AtomicU64>, OwnedWriteHalf) {
        let TestClient { mut lines, writer } = client;
        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok(Some(_)) = lines.next_line().await {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        (received, writer)
    }

    /// Publish one sample at a time until `done` holds for the registry.
    async fn publish_until(handle: &BridgeHandle, mut done: impl FnMut(&[ClientStats]) -> bool) {
        let ingest = handle.ingest();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        let mut timestamp_us = 0;
        while tokio::time::Instant::now() < deadline {
            for _ in 0..64 {
                timestamp_us += 1_000;
                ingest.publish(&calibrated(timestamp_us));
                tokio::task::yield_now().await;
            }
            if done(&handle.client_stats().await.unwrap()) {
                return;
            }
        }
        panic!("registry never reached the expected state");
    }

    async fn wait_for_more(received: &AtomicU64, than: u64) {
        for _ in 0..500 {
            if received.load(Ordering::Relaxed) > than {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client stopped receiving frames");
    }

    #[tokio::test]
    async fn overflowing_client_is_dropped_while_others_keep_receiving() {
        let mut config = local_config().with_queue_capacity(8);
        config.max_consecutive_drops = 32;
        config.write_timeout = Duration::from_secs(30);
        let handle = BridgeServer::bind(config, Arc::new(RecordingSink::default()))
            .await
            .unwrap()
            .spawn();

        let mut slow = stalled_client(handle.local_addr()).await;
        let healthy = TestClient::connect(handle.local_addr()).await;
        let healthy_addr = healthy.writer.local_addr().unwrap();
        let (received, _healthy_writer) = spawn_counting_reader(healthy);
        wait_for_clients(&handle, 2).await;

        publish_until(&handle, |clients| clients.len() == 1).await;
        let remaining = handle.client_stats().await.unwrap();
        assert_eq!(remaining[0].peer, healthy_addr);
        assert_eq!(remaining[0].state, ConnectionState::Active);

        // Closed well before the 30 s write timeout.
        let closed = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::copy(&mut slow, &mut tokio::io::sink()),
        )
        .await;
        assert!(closed.is_ok(), "overflowed client socket stayed open");

        let before = received.load(Ordering::Relaxed);
        handle.ingest().publish(&calibrated(u64::MAX / 2));
        wait_for_more(&received, before).await;
    }

    #[tokio::test]
    async fn stalled_write_times_out_and_closes_the_client() {
        let mut config = local_config();
        config.max_consecutive_drops = u64::MAX;
        config.write_timeout = Duration::from_millis(200);
        let handle = BridgeServer::bind(config, Arc::new(RecordingSink::default()))
            .await
            .unwrap()
            .spawn();

        let _slow = stalled_client(handle.local_addr()).await;
        let healthy = TestClient::connect(handle.local_addr()).await;
        let healthy_addr = healthy.writer.local_addr().unwrap();
        let (received, _healthy_writer) = spawn_counting_reader(healthy);
        wait_for_clients(&handle, 2).await;

        publish_until(&handle, |clients| clients.len() == 1).await;
        let remaining = handle.client_stats().await.unwrap();
        assert_eq!(remaining[0].peer, healthy_addr);

        let before = received.load(Ordering::Relaxed);
        handle.ingest().publish(&calibrated(u64::MAX / 2));
        wait_for_more(&received, before).await;
    }

    #[tokio::test]
    async fn half_closed_client_still_gets_its_queued_frames() {
        let handle = start(Arc::new(RecordingSink::default())).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 1).await;

        let ingest = handle.ingest();
        for i in 1..=40 {
            ingest.publish(&calibrated(i * 1_000));
        }
        // The stage handles messages in order, so after this round trip every
        // sample above is in the client's queue.
        handle.client_stats().await.unwrap();
        a.writer.shutdown().await.unwrap();

        let mut timestamps = Vec::new();
        while let Some(line) = tokio::time::timeout(Duration::from_secs(5), a.lines.next_line())
            .await
            .unwrap()
            .unwrap()
        {
            match TelemetryFrame::parse(&line).unwrap() {
                TelemetryFrame::Telemetry { sample, .. } => timestamps.push(sample.timestamp_us()),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(timestamps, (1..=40).map(|i| i * 1_000).collect::<Vec<u64>>());
        wait_for_clients(&handle, 0).await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let result = BridgeServer::bind(
            BridgeServerConfig::default().with_addr(addr),
            Arc::new(RecordingSink::default()),
        )
        .await;
        assert!(matches!(result, Err(AxonError::BindFailure { .. })));
    }

    #[tokio::test]
    async fn shutdown_closes_client_streams() {
        let handle = start(Arc::new(RecordingSink::default())).await;
        let mut a = TestClient::connect(handle.local_addr()).await;
        wait_for_clients(&handle, 1).await;

        handle.shutdown().await;
        let next = tokio::time::timeout(Duration::from_secs(5), a.lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, None);
    }
}
