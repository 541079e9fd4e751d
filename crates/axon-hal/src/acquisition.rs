//! [`AcquisitionLoop`] – the infinite sample stream over an unreliable link.
//!
//! The loop is an [`Iterator`] that never ends on its own: link loss moves it
//! to `Reconnecting`, where it keeps yielding heartbeat samples until the
//! link re-opens.  Only [`AcquisitionHandle::shutdown`] terminates it.
//!
//! ```text
//! Connecting ──open ok──▶ Active ──Disconnected / link timeout──▶ Reconnecting
//!     │  ▲                                                     │
//!     │  └──────────────── open ok ◀──────────────────────────┘
//!     └──── shutdown (any state) ──▶ Closed
//! ```
//!
//! Every sample, heartbeats included, is stamped from one [`SessionClock`],
//! so timestamps are strictly increasing for the whole session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use axon_types::{AxonError, CommandSink, LinkError, SensorSample, SessionClock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::link::SensorLink;

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Wait between failed open attempts.
    pub reconnect_backoff: Duration,
    /// Heartbeat cadence while the link is down.
    pub heartbeat_interval: Duration,
    /// An Active link with no valid frame for this long is treated as lost.
    pub link_timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(500),
            link_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

/// Counters shared between the loop and its handles.
#[derive(Debug, Default)]
pub struct LinkStats {
    samples: AtomicU64,
    malformed: AtomicU64,
    heartbeats: AtomicU64,
    reconnects: AtomicU64,
    commands_written: AtomicU64,
    commands_dropped: AtomicU64,
    backlog_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatsSnapshot {
    pub samples: u64,
    pub malformed: u64,
    pub heartbeats: u64,
    pub reconnects: u64,
    pub commands_written: u64,
    pub commands_dropped: u64,
    /// Samples discarded because the consumer channel was full.
    pub backlog_dropped: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            commands_written: self.commands_written.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            backlog_dropped: self.backlog_dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum LinkRequest {
    Command(String),
    Reset,
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable control surface for a running [`AcquisitionLoop`].
#[derive(Debug, Clone)]
pub struct AcquisitionHandle {
    requests: Sender<LinkRequest>,
    stats: Arc<LinkStats>,
}

impl AcquisitionHandle {
    /// Cancel a pending backoff and try to open the link now.  On an Active
    /// link this forces a close and re-open.
    pub fn reset(&self) {
        let _ = self.requests.send(LinkRequest::Reset);
    }

    pub fn shutdown(&self) {
        let _ = self.requests.send(LinkRequest::Shutdown);
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }
}

impl CommandSink for AcquisitionHandle {
    /// Queue a command for the link.  Delivery is best effort: commands that
    /// reach the loop while the link is down are dropped and counted.
    fn send_command(&self, raw_text: &str) -> Result<(), AxonError> {
        self.requests
            .send(LinkRequest::Command(raw_text.to_string()))
            .map_err(|_| {
                AxonError::Link(LinkError::Disconnected(
                    "acquisition loop has stopped".to_string(),
                ))
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

pub struct AcquisitionLoop<L> {
    link: L,
    config: AcquisitionConfig,
    state: LinkState,
    clock: SessionClock,
    requests_tx: Sender<LinkRequest>,
    requests_rx: Receiver<LinkRequest>,
    stats: Arc<LinkStats>,
    next_attempt: Instant,
    next_heartbeat: Instant,
    last_frame: Instant,
}

impl<L: SensorLink> AcquisitionLoop<L> {
    pub fn new(link: L, config: AcquisitionConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel();
        let now = Instant::now();
        Self {
            link,
            next_heartbeat: now + config.heartbeat_interval,
            config,
            state: LinkState::Connecting,
            clock: SessionClock::new(),
            requests_tx,
            requests_rx,
            stats: Arc::new(LinkStats::default()),
            next_attempt: now,
            last_frame: now,
        }
    }

    pub fn handle(&self) -> AcquisitionHandle {
        AcquisitionHandle {
            requests: self.requests_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Release the link and end the sequence.
    pub fn close(&mut self) {
        if self.state != LinkState::Closed {
            self.link.close();
            self.state = LinkState::Closed;
            info!(link = %self.link.describe(), "acquisition closed");
        }
    }

    fn drain_requests(&mut self) {
        while let Ok(request) = self.requests_rx.try_recv() {
            self.handle_request(request);
        }
    }

    fn handle_request(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Command(text) => self.write_command(&text),
            LinkRequest::Reset => match self.state {
                LinkState::Connecting | LinkState::Reconnecting => {
                    info!(link = %self.link.describe(), "reset requested; retrying link now");
                    self.next_attempt = Instant::now();
                }
                LinkState::Active => {
                    info!(link = %self.link.describe(), "reset requested; re-opening link");
                    self.link.close();
                    self.state = LinkState::Reconnecting;
                    self.next_attempt = Instant::now();
                }
                LinkState::Closed => {}
            },
            LinkRequest::Shutdown => self.close(),
        }
    }

    fn write_command(&mut self, text: &str) {
        if self.state != LinkState::Active {
            LinkStats::bump(&self.stats.commands_dropped);
            warn!(command = %text, state = ?self.state, "link not active; command dropped");
            return;
        }
        match self.link.write_command(text.as_bytes()) {
            Ok(()) => {
                LinkStats::bump(&self.stats.commands_written);
                debug!(command = %text, "command written to link");
            }
            Err(LinkError::Disconnected(reason)) => {
                LinkStats::bump(&self.stats.commands_dropped);
                warn!(command = %text, "command dropped; link lost while writing");
                self.enter_reconnect(&reason);
            }
            Err(e) => {
                LinkStats::bump(&self.stats.commands_dropped);
                warn!(command = %text, error = %e, "command write failed");
            }
        }
    }

    fn enter_reconnect(&mut self, reason: &str) {
        warn!(link = %self.link.describe(), reason = %reason, "link lost; reconnecting");
        self.link.close();
        LinkStats::bump(&self.stats.reconnects);
        let now = Instant::now();
        self.state = LinkState::Reconnecting;
        self.next_attempt = now + self.config.reconnect_backoff;
        self.next_heartbeat = now;
    }

    fn heartbeat(&mut self) -> SensorSample {
        LinkStats::bump(&self.stats.heartbeats);
        self.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
        SensorSample::heartbeat(self.clock.now_us(), self.link.source())
    }

    fn check_link_timeout(&mut self) {
        if self.last_frame.elapsed() >= self.config.link_timeout {
            self.enter_reconnect("no valid frame within link timeout");
        }
    }

    /// One step while the link is down.  Returns a heartbeat when one is due.
    fn step_disconnected(&mut self) -> Option<SensorSample> {
        let now = Instant::now();
        if now >= self.next_attempt {
            match self.link.open() {
                Ok(()) => {
                    info!(link = %self.link.describe(), "link open");
                    self.state = LinkState::Active;
                    self.last_frame = Instant::now();
                    return None;
                }
                Err(e) => {
                    debug!(link = %self.link.describe(), error = %e, "link open failed; backing off");
                    self.next_attempt = now + self.config.reconnect_backoff;
                }
            }
        }

        let now = Instant::now();
        if now >= self.next_heartbeat {
            return Some(self.heartbeat());
        }

        let wake = self.next_attempt.min(self.next_heartbeat);
        match self.requests_rx.recv_timeout(wake.saturating_duration_since(now)) {
            Ok(request) => self.handle_request(request),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        None
    }
}

impl<L: SensorLink> Iterator for AcquisitionLoop<L> {
    type Item = SensorSample;

    fn next(&mut self) -> Option<SensorSample> {
        loop {
            self.drain_requests();
            match self.state {
                LinkState::Closed => return None,
                LinkState::Connecting | LinkState::Reconnecting => {
                    if let Some(heartbeat) = self.step_disconnected() {
                        return Some(heartbeat);
                    }
                }
                LinkState::Active => match self.link.read_frame() {
                    Ok(reading) => {
                        self.last_frame = Instant::now();
                        LinkStats::bump(&self.stats.samples);
                        return Some(SensorSample::new(
                            self.clock.now_us(),
                            self.link.source(),
                            reading,
                        ));
                    }
                    Err(LinkError::Malformed(reason)) => {
                        LinkStats::bump(&self.stats.malformed);
                        debug!(link = %self.link.describe(), reason = %reason, "malformed frame discarded");
                        self.check_link_timeout();
                    }
                    Err(LinkError::Timeout) => self.check_link_timeout(),
                    Err(LinkError::Disconnected(reason)) => self.enter_reconnect(&reason),
                },
            }
        }
    }
}

/// Run `acquisition` on a dedicated thread, forwarding samples into a
/// bounded channel.
///
/// The consumer is never waited on: when the channel is full the sample is
/// dropped and counted in `backlog_dropped`, so a stalled consumer cannot
/// hold up link reads, command writes or the link timeout.  The thread ends
/// on shutdown or once the receiver is dropped.
pub fn spawn_acquisition<L>(
    mut acquisition: AcquisitionLoop<L>,
    capacity: usize,
) -> Result<(AcquisitionHandle, tokio::sync::mpsc::Receiver<SensorSample>), AxonError>
where
    L: SensorLink + 'static,
{
    let handle = acquisition.handle();
    let stats = Arc::clone(&acquisition.stats);
    let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));

    std::thread::Builder::new()
        .name("axon-acquisition".to_string())
        .spawn(move || {
            let mut burst = 0u64;
            while let Some(sample) = acquisition.next() {
                match tx.try_send(sample) {
                    Ok(()) => {
                        if burst > 0 {
                            info!(dropped = burst, "sample consumer caught up");
                            burst = 0;
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        if burst == 0 {
                            warn!(capacity = tx.max_capacity(), "sample consumer is behind; dropping samples");
                        }
                        burst += 1;
                        LinkStats::bump(&stats.backlog_dropped);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("sample receiver dropped; stopping acquisition");
                        break;
                    }
                }
            }
            acquisition.close();
        })
        .map_err(|e| AxonError::Config(format!("failed to spawn acquisition thread: {e}")))?;

    Ok((handle, rx))
}
