//! [`BridgeClient`] – the remote end of the telemetry bridge.
//!
//! Connects to a [`BridgeServer`](crate::BridgeServer), turns wire lines into
//! [`BridgeEvent`]s and writes commands back.  The connection lifecycle
//! mirrors the serial acquisition loop:
//!
//! ```text
//!  Connecting ──ok──▶ Active ──EOF / error / silence──▶ Reconnecting ──backoff──▶ Connecting
//!       │                                                     │
//!       └────────────────────── refused ──────────────────────┘   (heartbeats meanwhile)
//! ```
//!
//! While not Active the client emits heartbeat samples so downstream
//! consumers keep seeing a clock; their timestamps continue from the last
//! sample that arrived over the wire.

use std::time::Duration;

use axon_types::wire::{NOTICE_PREFIX, is_notice};
use axon_types::{AxonError, CommandSink, SampleSource, SensorSample, TelemetryFrame};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lines::{LineEvent, LineReader};
use crate::server::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    /// `host:port` of the bridge server.
    pub addr: String,
    pub connect_timeout: Duration,
    /// An Active connection that delivers no line for this long is dropped.
    pub link_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub event_capacity: usize,
    pub command_capacity: usize,
    pub max_line_bytes: usize,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout: Duration::from_secs(2),
            link_timeout: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(500),
            event_capacity: 256,
            command_capacity: 32,
            max_line_bytes: 16 * 1024,
        }
    }
}

impl BridgeClientConfig {
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected,
    Disconnected { reason: String },
    Frame(TelemetryFrame),
    /// Synthetic sample emitted while the server is unreachable.
    Heartbeat(SensorSample),
    /// Text of a `#` line, without the prefix.
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientControl {
    ReconnectNow,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable control surface of a running [`BridgeClient`].
#[derive(Clone)]
pub struct BridgeClientHandle {
    commands: mpsc::Sender<String>,
    control: mpsc::Sender<ClientControl>,
    state: watch::Receiver<ClientState>,
}

impl BridgeClientHandle {
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Active
    }

    /// Drop the current connection (or skip the remaining backoff) and
    /// connect again.
    pub fn reconnect_now(&self) {
        let _ = self.control.try_send(ClientControl::ReconnectNow);
    }

    pub fn shutdown(&self) {
        let _ = self.control.try_send(ClientControl::Shutdown);
    }

    /// Wait until the client reaches `state`.
    pub async fn wait_for_state(&self, state: ClientState) -> Result<(), AxonError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| AxonError::NotConnected)
    }
}

impl CommandSink for BridgeClientHandle {
    fn send_command(&self, raw_text: &str) -> Result<(), AxonError> {
        let raw_text = raw_text.trim();
        if raw_text.is_empty() {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(AxonError::NotConnected);
        }
        self.commands
            .try_send(raw_text.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    AxonError::Protocol("outbound command queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => AxonError::NotConnected,
            })
    }
}

// ---------------------------------------------------------------------------
// Client task
// ---------------------------------------------------------------------------

pub struct BridgeClient;

impl BridgeClient {
    /// Start the client task.  The task ends after [`BridgeClientHandle::shutdown`],
    /// when every handle is dropped, or when the event receiver is dropped.
    pub fn spawn(config: BridgeClientConfig) -> (BridgeClientHandle, mpsc::Receiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);

        let runner = Runner {
            config,
            events: events_tx,
            commands: commands_rx,
            control: control_rx,
            state: state_tx,
            clock: HeartbeatClock::new(),
        };
        tokio::spawn(runner.run());

        let handle = BridgeClientHandle {
            commands: commands_tx,
            control: control_tx,
            state: state_rx,
        };
        (handle, events_rx)
    }
}

/// Timestamps for heartbeats, continuing from the last received sample.
struct HeartbeatClock {
    base_us: u64,
    anchor: Instant,
    last_us: u64,
    source: SampleSource,
}

impl HeartbeatClock {
    fn new() -> Self {
        Self {
            base_us: 0,
            anchor: Instant::now(),
            last_us: 0,
            source: SampleSource::Hardware,
        }
    }

    fn observe(&mut self, sample: &SensorSample) {
        self.base_us = sample.timestamp_us();
        self.anchor = Instant::now();
        self.last_us = self.last_us.max(sample.timestamp_us());
        self.source = sample.source();
    }

    fn heartbeat(&mut self) -> SensorSample {
        let elapsed = u64::try_from(self.anchor.elapsed().as_micros()).unwrap_or(u64::MAX);
        let timestamp_us = self
            .base_us
            .saturating_add(elapsed)
            .max(self.last_us.saturating_add(1));
        self.last_us = timestamp_us;
        SensorSample::heartbeat(timestamp_us, self.source)
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Attempt {
    Connected(TcpStream),
    Failed,
    Restart,
    Stop,
}

enum SessionEnd {
    Lost(String),
    ReconnectRequested,
    Stop,
}

struct Runner {
    config: BridgeClientConfig,
    events: mpsc::Sender<BridgeEvent>,
    commands: mpsc::Receiver<String>,
    control: mpsc::Receiver<ClientControl>,
    state: watch::Sender<ClientState>,
    clock: HeartbeatClock,
}

impl Runner {
    async fn run(mut self) {
        // One ticker spans the whole time the client is not Active, connect
        // attempts included.
        let mut heartbeats = self.heartbeat_ticker(false);
        loop {
            self.state.send_replace(ClientState::Connecting);
            let stream = match self.connect(&mut heartbeats).await {
                Attempt::Connected(stream) => Some(stream),
                Attempt::Failed => None,
                Attempt::Restart => continue,
                Attempt::Stop => break,
            };

            if let Some(stream) = stream {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "set_nodelay failed");
                }
                self.state.send_replace(ClientState::Active);
                info!(addr = %self.config.addr, "bridge connected");
                if !self.emit(BridgeEvent::Connected).await {
                    break;
                }

                let end = self.session(stream).await;
                self.state.send_replace(ClientState::Reconnecting);
                self.discard_pending_commands();
                let (reason, retry_now) = match end {
                    SessionEnd::Stop => break,
                    SessionEnd::ReconnectRequested => ("reconnect requested".to_string(), true),
                    SessionEnd::Lost(reason) => (reason, false),
                };
                warn!(addr = %self.config.addr, reason = %reason, "bridge connection lost");
                if !self.emit(BridgeEvent::Disconnected { reason }).await {
                    break;
                }
                heartbeats = self.heartbeat_ticker(true);
                if retry_now {
                    continue;
                }
            }

            self.state.send_replace(ClientState::Reconnecting);
            match self.backoff(&mut heartbeats).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }

        self.state.send_replace(ClientState::Closed);
        debug!("bridge client stopped");
    }

    /// Heartbeat ticker for a not-Active period.  After a lost connection the
    /// first heartbeat is due at once.
    fn heartbeat_ticker(&self, immediate: bool) -> Interval {
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let start = if immediate { Instant::now() } else { Instant::now() + period };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// One connect attempt, bounded by `connect_timeout`, emitting heartbeats
    /// while it is pending.
    async fn connect(&mut self, heartbeats: &mut Interval) -> Attempt {
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr.clone()),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return match result {
                    Ok(Ok(stream)) => Attempt::Connected(stream),
                    Ok(Err(e)) => {
                        warn!(addr = %self.config.addr, error = %e, "bridge connect failed");
                        Attempt::Failed
                    }
                    Err(_) => {
                        warn!(addr = %self.config.addr, "bridge connect timed out");
                        Attempt::Failed
                    }
                },
                _ = heartbeats.tick() => {
                    if !self.emit_heartbeat().await {
                        return Attempt::Stop;
                    }
                }
                control = self.control.recv() => match control {
                    Some(ClientControl::ReconnectNow) => return Attempt::Restart,
                    Some(ClientControl::Shutdown) | None => return Attempt::Stop,
                },
            }
        }
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = LineReader::new(read_half, self.config.max_line_bytes);
        let mut commands_open = true;
        let mut deadline = Instant::now() + self.config.link_timeout;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(LineEvent::Line(line))) => {
                        deadline = Instant::now() + self.config.link_timeout;
                        if !self.handle_line(&line).await {
                            return SessionEnd::Stop;
                        }
                    }
                    Ok(Some(LineEvent::TooLong)) => {
                        deadline = Instant::now() + self.config.link_timeout;
                        warn!(limit = self.config.max_line_bytes, "over-long bridge line skipped");
                    }
                    Ok(None) => return SessionEnd::Lost("server closed the connection".to_string()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },

                _ = tokio::time::sleep_until(deadline) => {
                    return SessionEnd::Lost("no frame within link timeout".to_string());
                }

                command = self.commands.recv(), if commands_open => match command {
                    Some(mut text) => {
                        text.push('\n');
                        if let Err(e) = write_half.write_all(text.as_bytes()).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => commands_open = false,
                },

                control = self.control.recv() => match control {
                    Some(ClientControl::ReconnectNow) => return SessionEnd::ReconnectRequested,
                    Some(ClientControl::Shutdown) | None => {
                        let _ = write_half.shutdown().await;
                        return SessionEnd::Stop;
                    }
                },
            }
        }
    }

    /// Returns `false` once the event receiver is gone.
    async fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        if is_notice(line) {
            let text = line.trim_start_matches(NOTICE_PREFIX).trim().to_string();
            return self.emit(BridgeEvent::Notice(text)).await;
        }
        match TelemetryFrame::parse(line) {
            Ok(frame) => {
                if let TelemetryFrame::Telemetry { sample, .. } = &frame {
                    self.clock.observe(sample);
                }
                self.emit(BridgeEvent::Frame(frame)).await
            }
            Err(e) => {
                warn!(error = %e, "unparseable bridge line skipped");
                true
            }
        }
    }

    /// Emit heartbeats until the backoff elapses.
    async fn backoff(&mut self, heartbeats: &mut Interval) -> Flow {
        let deadline = Instant::now() + self.config.reconnect_backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
                _ = heartbeats.tick() => {
                    if !self.emit_heartbeat().await {
                        return Flow::Stop;
                    }
                }
                control = self.control.recv() => match control {
                    Some(ClientControl::ReconnectNow) => return Flow::Continue,
                    Some(ClientControl::Shutdown) | None => return Flow::Stop,
                },
            }
        }
    }

    async fn emit_heartbeat(&mut self) -> bool {
        let heartbeat = self.clock.heartbeat();
        self.emit(BridgeEvent::Heartbeat(heartbeat)).await
    }

    fn discard_pending_commands(&mut self) {
        let mut dropped = 0u64;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "commands discarded; bridge connection lost before they were sent");
        }
    }

    async fn emit(&self, event: BridgeEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axon_types::{CalibratedSample, CalibrationStatus, SensorReading, TelemetrySink, Vec3};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{BridgeServer, BridgeServerConfig};

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

    fn sample(timestamp_us: u64) -> SensorSample {
        SensorSample::new(
            timestamp_us,
            SampleSource::Simulated,
            SensorReading {
                accel: Vec3::new(0.0, 0.0, 1.0),
                gyro: Vec3::new(1.0, 2.0, 3.0),
                battery_voltage: 11.8,
                battery_percent: 75.0,
                link_quality: 96,
            },
        )
    }

    async fn next_event(events: &mut mpsc::Receiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timed out")
            .expect("event stream ended")
    }

    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn receives_frames_and_echoes_from_a_live_server() {
        let sink = Arc::new(RecordingSink::default());
        let server = BridgeServer::bind(
            BridgeServerConfig::default().with_addr(SocketAddr::from(([127, 0, 0, 1], 0))),
            sink.clone(),
        )
        .await
        .unwrap()
        .spawn();

        let (handle, mut events) = BridgeClient::spawn(
            BridgeClientConfig::default().with_addr(server.local_addr().to_string()),
        );
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            BridgeEvent::Notice("Axon serial bridge ready".to_string())
        );

        let raw = sample(40_000);
        server.ingest().publish(&CalibratedSample {
            gyro: raw.gyro(),
            raw: raw.clone(),
            status: CalibrationStatus::Uncalibrated,
        });
        match next_event(&mut events).await {
            BridgeEvent::Frame(TelemetryFrame::Telemetry { sample, status, .. }) => {
                assert_eq!(sample, raw);
                assert_eq!(status, CalibrationStatus::Uncalibrated);
            }
            other => panic!("unexpected event {other:?}"),
        }

        handle.send_command("LED ON").unwrap();
        match next_event(&mut events).await {
            BridgeEvent::Frame(TelemetryFrame::CommandEcho { raw_text, .. }) => {
                assert_eq!(raw_text, "LED ON");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(*sink.commands.lock(), vec!["LED ON".to_string()]);

        handle.shutdown();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeats_while_the_server_is_unreachable() {
        let config = BridgeClientConfig::default()
            .with_addr(unused_addr().to_string())
            .with_reconnect_backoff(Duration::from_millis(200))
            .with_heartbeat_interval(Duration::from_millis(50));
        let (handle, mut events) = BridgeClient::spawn(config);

        let mut timestamps = Vec::new();
        while timestamps.len() < 3 {
            match next_event(&mut events).await {
                BridgeEvent::Heartbeat(sample) => {
                    assert!(sample.is_heartbeat());
                    timestamps.push(sample.timestamp_us());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert!(matches!(
            handle.send_command("LED ON"),
            Err(AxonError::NotConnected)
        ));
        handle.shutdown();
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frame = TelemetryFrame::Telemetry {
            seq: 5,
            status: CalibrationStatus::Calibrated,
            sample: sample(1_000_000),
        };
        let payload = format!("garbage line\nTEL x\n{}", frame.encode().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(payload.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (handle, mut events) = BridgeClient::spawn(
            BridgeClientConfig::default().with_addr(addr.to_string()),
        );
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
        assert_eq!(next_event(&mut events).await, BridgeEvent::Frame(frame));
        handle.shutdown();
        server.abort();
    }

    #[tokio::test]
    async fn heartbeats_continue_from_the_last_sample_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frame = TelemetryFrame::Telemetry {
            seq: 1,
            status: CalibrationStatus::Calibrated,
            sample: sample(9_000_000),
        };
        let payload = frame.encode().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(payload.as_bytes()).await.unwrap();
        });

        let config = BridgeClientConfig::default()
            .with_addr(addr.to_string())
            .with_reconnect_backoff(Duration::from_secs(10));
        let (handle, mut events) = BridgeClient::spawn(config);
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
        assert!(matches!(next_event(&mut events).await, BridgeEvent::Frame(_)));
        assert!(matches!(
            next_event(&mut events).await,
            BridgeEvent::Disconnected { .. }
        ));
        match next_event(&mut events).await {
            BridgeEvent::Heartbeat(heartbeat) => {
                assert!(heartbeat.timestamp_us() > 9_000_000);
                assert_eq!(heartbeat.source(), SampleSource::Simulated);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.state(), ClientState::Reconnecting);
        handle.shutdown();
    }

    #[tokio::test]
    async fn silent_server_is_dropped_after_the_link_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = BridgeClientConfig::default()
            .with_addr(addr.to_string())
            .with_link_timeout(Duration::from_millis(200))
            .with_reconnect_backoff(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_millis(50));
        let (handle, mut events) = BridgeClient::spawn(config);
        assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
        let connected_at = Instant::now();

        match next_event(&mut events).await {
            BridgeEvent::Disconnected { reason } => assert!(reason.contains("link timeout")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(connected_at.elapsed() >= Duration::from_millis(150));
        assert!(matches!(
            next_event(&mut events).await,
            BridgeEvent::Heartbeat(_)
        ));
        assert_eq!(handle.state(), ClientState::Reconnecting);
        handle.shutdown();
        server.abort();
    }

    #[tokio::test]
    async fn heartbeats_keep_flowing_while_a_connect_attempt_hangs() {
        // 192.0.2.0/24 is never routed: the attempt hangs until its timeout
        // or fails at once, and heartbeats must arrive either way.
        let config = BridgeClientConfig::default()
            .with_addr("192.0.2.1:9")
            .with_connect_timeout(Duration::from_secs(30))
            .with_reconnect_backoff(Duration::from_secs(30))
            .with_heartbeat_interval(Duration::from_millis(50));
        let (handle, mut events) = BridgeClient::spawn(config);

        let started = Instant::now();
        for _ in 0..3 {
            assert!(matches!(
                next_event(&mut events).await,
                BridgeEvent::Heartbeat(_)
            ));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn shutdown_ends_the_event_stream() {
        let config = BridgeClientConfig::default()
            .with_addr(unused_addr().to_string())
            .with_reconnect_backoff(Duration::from_secs(10));
        let (handle, mut events) = BridgeClient::spawn(config);
        handle.shutdown();

        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
        handle.wait_for_state(ClientState::Closed).await.unwrap();
    }
}
