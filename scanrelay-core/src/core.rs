//! Host-driven API: RelayCore receives events from the daemon, returns actions.
//!
//! The core owns the connection state machine and the session overlay. It performs no
//! network I/O; the spillover cache and ack tracker sit behind `SharedStore` so the drain
//! worker can reach them too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ack::AckTracker;
use crate::backoff::{Backoff, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
use crate::cache::SpilloverCache;
use crate::codec::{self, Encoded};
use crate::integrity;
use crate::protocol::{Body, Message, PROTOCOL_VERSION};
use crate::session::{Features, Session, StateSubscription};
use crate::wire;

/// Ack tick period when the collector has not negotiated a keepalive interval.
pub const DEFAULT_ACK_INTERVAL: Duration = Duration::from_secs(60);

/// State shared between the event loop and the drain worker, guarded by one mutex.
#[derive(Debug)]
pub struct Store {
    pub cache: SpilloverCache,
    pub acks: AckTracker,
}

pub type SharedStore = Arc<Mutex<Store>>;

impl Store {
    pub fn new(cache: SpilloverCache, acks: AckTracker) -> Self {
        Self { cache, acks }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Reported in reply to a hostname request.
    pub hostname: String,
    /// Initial state of the relay-wide caching switch.
    pub caching: bool,
    pub ack_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            caching: true,
            ack_interval: DEFAULT_ACK_INTERVAL,
            reconnect_min: DEFAULT_MIN_DELAY,
            reconnect_max: DEFAULT_MAX_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Process exit status. The numeric codes are part of the daemon's interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Normal = 0,
    /// The local port is already bound, most likely by another instance.
    PortInUse = 1,
    CredentialsMissing = 2,
    CredentialsRejected = 3,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Why an outbound connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connect failed: {0}")]
    Transient(String),
    #[error("transport credentials missing: {0}")]
    CredentialsMissing(String),
    #[error("credentials rejected by collector: {0}")]
    CredentialsRejected(String),
}

impl ConnectError {
    /// Fatal errors map to an exit status; transient ones are retried.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ConnectError::Transient(_) => None,
            ConnectError::CredentialsMissing(_) => Some(ExitStatus::CredentialsMissing),
            ConnectError::CredentialsRejected(_) => Some(ExitStatus::CredentialsRejected),
        }
    }
}

/// Input to the state machine.
#[derive(Debug)]
pub enum Event {
    /// One line from a local producer.
    LocalLine(String),
    Connected(Instant),
    ConnectFailed(ConnectError),
    /// The transport closed (peer, error, or a requested `CloseTransport`).
    Disconnected,
    /// One wire payload from the collector, length prefix removed.
    Frame { payload: Vec<u8>, at: Instant },
    ReconnectTimer,
    AckTimer,
    KeepaliveTimer,
    /// Periodic supervision: keepalive deadline and cache size.
    Supervise(Instant),
    /// Records popped from the cache by the drain worker.
    Replay(Vec<Message>),
    /// The drain worker started for this epoch has stopped.
    DrainFinished(u64),
    Shutdown,
}

/// Output of the state machine; the daemon performs these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write one length-prefixed frame to the collector.
    Send(Vec<u8>),
    Connect,
    ScheduleReconnect(Duration),
    CloseTransport,
    /// Run the ack tick at this period; `None` stops it.
    SetAckTimer(Option<Duration>),
    SetKeepaliveTimer(Option<Duration>),
    /// Start a drain worker tagged with this epoch.
    StartDrain(u64),
    CancelDrain,
    Indicator(bool),
    Exit(ExitStatus),
}

/// Connection manager. The daemon passes events; the core returns actions.
pub struct RelayCore {
    config: RelayConfig,
    store: SharedStore,
    state: ConnectionState,
    session: Option<Session>,
    backoff: Backoff,
    caching: bool,
    drain_epoch: u64,
    draining: bool,
    /// Replayed records whose kind the collector has not enabled yet in this session.
    deferred: Vec<Message>,
    /// A keepalive teardown was requested and the transport has not reported closed yet.
    closing: bool,
    stopping: bool,
    scanner_started: Option<u64>,
    system_booted: u64,
}

impl RelayCore {
    pub fn new(config: RelayConfig, store: SharedStore) -> Self {
        Self {
            backoff: Backoff::new(config.reconnect_min, config.reconnect_max),
            caching: config.caching,
            config,
            store,
            state: ConnectionState::Disconnected,
            session: None,
            drain_epoch: 0,
            draining: false,
            deferred: Vec::new(),
            closing: false,
            stopping: false,
            scanner_started: None,
            system_booted: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Feature overlay in effect: the session's, or the defaults while offline.
    pub fn features(&self) -> Features {
        self.session
            .as_ref()
            .map(|s| s.features.clone())
            .unwrap_or_default()
    }

    /// System boot time (Unix seconds) reported in uptime messages.
    pub fn set_system_booted(&mut self, booted: u64) {
        self.system_booted = booted;
    }

    /// First outbound attempt.
    pub fn start(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Connecting;
        vec![Action::Connect]
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::LocalLine(line) => self.on_local_line(&line),
            Event::Connected(at) => self.on_connected(at),
            Event::ConnectFailed(err) => self.on_connect_failed(err),
            Event::Disconnected => self.on_disconnected(),
            Event::Frame { payload, at } => self.on_frame(&payload, at),
            Event::ReconnectTimer => self.on_reconnect_timer(),
            Event::AckTimer => self.on_ack_timer(),
            Event::KeepaliveTimer => self.on_keepalive_timer(),
            Event::Supervise(at) => self.on_supervise(at),
            Event::Replay(messages) => self.on_replay(messages),
            Event::DrainFinished(epoch) => {
                if epoch == self.drain_epoch {
                    self.draining = false;
                }
                Vec::new()
            }
            Event::Shutdown => self.on_shutdown(),
        }
    }

    /// Deliver a message: to the wire when connected and enabled, else to the cache when
    /// caching is on, else nowhere. Never blocks.
    pub fn send(&mut self, msg: Message) -> Vec<Action> {
        let kind = msg.kind();
        if let Some(session) = &self.session {
            if !session.features.allows(&msg.body) {
                tracing::debug!(?kind, "kind disabled for this session, dropping");
                return Vec::new();
            }
            let (payload, checksum) = match integrity::serialize_with_checksum(&msg) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(?kind, error = %e, "cannot serialize message");
                    return Vec::new();
                }
            };
            if kind.is_telemetry() {
                self.store.lock().acks.track(msg, checksum);
            }
            return vec![Action::Send(wire::frame_payload(&payload))];
        }

        if self.caching && kind.is_telemetry() {
            if !self.store.lock().cache.append_message(&msg) {
                tracing::debug!(?kind, "cache not accepting writes, dropping");
            }
        } else {
            tracing::debug!(?kind, "offline and not caching, dropping");
        }
        Vec::new()
    }

    fn on_local_line(&mut self, line: &str) -> Vec<Action> {
        match codec::encode_line(line, &self.features()) {
            Ok(Encoded::Message(msg)) => self.send(msg),
            Ok(Encoded::ScannerStarted(at)) => {
                tracing::debug!(scanner_started = at, "scanner uptime announced");
                self.scanner_started = Some(at);
                if self.session.as_ref().is_some_and(|s| s.features.uptime) {
                    self.reply(self.uptime()).into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            Err(e) if e.is_malformed() => {
                tracing::warn!(line, error = %e, "dropping malformed line");
                Vec::new()
            }
            Err(e) => {
                tracing::trace!(error = %e, "line filtered");
                Vec::new()
            }
        }
    }

    fn on_connected(&mut self, at: Instant) -> Vec<Action> {
        if self.stopping {
            return vec![Action::CloseTransport];
        }
        tracing::info!("connected to collector");
        self.state = ConnectionState::Connected;
        self.session = Some(Session::new(at));
        self.backoff.reset();
        self.closing = false;
        self.store.lock().cache.close_for_writing();

        let mut actions = vec![
            Action::Indicator(true),
            Action::SetAckTimer(Some(self.config.ack_interval)),
            Action::SetKeepaliveTimer(None),
        ];
        actions.extend(self.start_drain());
        actions
    }

    fn on_connect_failed(&mut self, err: ConnectError) -> Vec<Action> {
        self.state = ConnectionState::Disconnected;
        if let Some(status) = err.exit_status() {
            tracing::error!(error = %err, code = status.code(), "fatal connect error");
            self.stopping = true;
            let mut actions = Vec::new();
            if self.draining {
                self.draining = false;
                actions.push(Action::CancelDrain);
            }
            if self.session.take().is_some() {
                actions.push(Action::Indicator(false));
                self.spill_in_flight();
            }
            actions.push(Action::Exit(status));
            return actions;
        }
        if self.stopping {
            return Vec::new();
        }
        tracing::warn!(error = %err, "connect failed");
        vec![self.schedule_reconnect()]
    }

    fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if self.stopping || self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Connect]
    }

    fn on_disconnected(&mut self) -> Vec<Action> {
        if self.session.take().is_none() {
            return Vec::new();
        }
        tracing::info!("disconnected from collector");
        self.state = ConnectionState::Disconnected;
        self.closing = false;

        let mut actions = vec![
            Action::SetKeepaliveTimer(None),
            Action::SetAckTimer(None),
            Action::Indicator(false),
        ];
        if self.draining {
            self.draining = false;
            actions.push(Action::CancelDrain);
        }
        self.spill_in_flight();
        if !self.stopping {
            actions.push(self.schedule_reconnect());
        }
        actions
    }

    fn on_frame(&mut self, payload: &[u8], at: Instant) -> Vec<Action> {
        if self.session.is_none() {
            tracing::debug!("frame outside a session, ignoring");
            return Vec::new();
        }
        let msg = match wire::deserialize(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        match msg.body {
            Body::Ack { checksum } => {
                if !self.store.lock().acks.acknowledge(&checksum) {
                    tracing::debug!(%checksum, "ack for untracked message");
                }
            }
            Body::Keepalive => {
                if let Some(s) = self.session.as_mut() {
                    s.on_keepalive_received(at);
                }
            }
            Body::HostnameRequest => {
                actions.extend(self.reply(Body::Hostname {
                    hostname: self.config.hostname.clone(),
                    protocol_version: PROTOCOL_VERSION,
                }));
            }
            Body::KeepaliveRequest { enable, interval } => {
                actions.extend(self.ack(payload));
                let interval =
                    (enable && interval > 0).then(|| Duration::from_secs(u64::from(interval)));
                if let Some(s) = self.session.as_mut() {
                    s.set_keepalive(interval, at);
                }
                tracing::info!(?interval, "keepalive negotiated");
                actions.push(Action::SetKeepaliveTimer(interval));
                actions.push(Action::SetAckTimer(Some(
                    interval.unwrap_or(self.config.ack_interval),
                )));
            }
            Body::CachingRequest {
                enable_caching,
                push_cache,
                clear_cache,
            } => {
                actions.extend(self.ack(payload));
                self.caching = enable_caching;
                if clear_cache {
                    self.deferred.clear();
                    if let Err(e) = self.store.lock().cache.clear() {
                        tracing::warn!(error = %e, "cannot clear cache");
                    }
                }
                if push_cache {
                    actions.extend(self.start_drain());
                }
            }
            Body::StateRequest {
                bluetooth,
                wifi,
                antenna,
                frequency,
            } => {
                actions.extend(self.ack(payload));
                if let Some(s) = self.session.as_mut() {
                    s.features.state = StateSubscription {
                        bluetooth,
                        wifi,
                        antenna,
                        frequency,
                    };
                }
                actions.extend(self.release_deferred());
            }
            Body::UptimeRequest { enable } => {
                actions.extend(self.ack(payload));
                if let Some(s) = self.session.as_mut() {
                    s.features.uptime = enable;
                }
                if enable {
                    actions.extend(self.reply(self.uptime()));
                }
            }
            Body::StartDataRequest {
                enable_data,
                bluetooth_raw,
                wifi_raw,
                wifi_devraw,
                sensor_mac,
            } => {
                actions.extend(self.ack(payload));
                if let Some(s) = self.session.as_mut() {
                    s.features.data = enable_data;
                    s.features.bluetooth_raw = bluetooth_raw;
                    s.features.wifi_raw = wifi_raw;
                    s.features.wifi_devraw = wifi_devraw;
                    s.features.sensor_mac = sensor_mac;
                }
                actions.extend(self.release_deferred());
            }
            other => tracing::debug!(kind = ?other.kind(), "unexpected message from collector"),
        }
        actions
    }

    fn on_ack_timer(&mut self) -> Vec<Action> {
        let connected = self.session.is_some();
        let outcome = self.store.lock().acks.tick(connected);
        outcome.resend.iter().filter_map(|m| self.frame(m)).collect()
    }

    fn on_keepalive_timer(&mut self) -> Vec<Action> {
        match &self.session {
            Some(s) if s.features.keepalive.is_some() => {
                self.frame(&Message::new(Body::Keepalive)).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn on_supervise(&mut self, at: Instant) -> Vec<Action> {
        self.store.lock().cache.refresh_size();
        let expired = self
            .session
            .as_ref()
            .is_some_and(|s| s.keepalive_expired(at));
        if expired && !self.closing {
            tracing::warn!("keepalive deadline missed, closing transport");
            self.closing = true;
            return vec![Action::CloseTransport];
        }
        Vec::new()
    }

    /// Replayed records of kinds not enabled yet are held until the collector enables them
    /// or the session ends.
    fn on_replay(&mut self, messages: Vec<Message>) -> Vec<Action> {
        let mut actions = Vec::with_capacity(messages.len());
        for msg in messages {
            if self
                .session
                .as_ref()
                .is_some_and(|s| !s.features.allows(&msg.body))
            {
                self.deferred.push(msg);
                continue;
            }
            actions.extend(self.send(msg));
        }
        actions
    }

    fn release_deferred(&mut self) -> Vec<Action> {
        let Some(features) = self.session.as_ref().map(|s| s.features.clone()) else {
            return Vec::new();
        };
        let (ready, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|m| features.allows(&m.body));
        self.deferred = held;
        if !ready.is_empty() {
            tracing::debug!(released = ready.len(), "sending held replay records");
        }
        ready.into_iter().flat_map(|m| self.send(m)).collect()
    }

    fn on_shutdown(&mut self) -> Vec<Action> {
        tracing::info!("shutting down");
        self.stopping = true;
        let mut actions = Vec::new();
        if self.draining {
            self.draining = false;
            actions.push(Action::CancelDrain);
        }
        if self.session.take().is_some() {
            actions.push(Action::CloseTransport);
            actions.push(Action::Indicator(false));
        }
        self.state = ConnectionState::Disconnected;
        self.spill_in_flight();
        actions.push(Action::Exit(ExitStatus::Normal));
        actions
    }

    /// Reopen the cache for writing, then move held replay records and unacknowledged
    /// messages into it.
    fn spill_in_flight(&mut self) {
        let caching = self.caching;
        let deferred = std::mem::take(&mut self.deferred);
        let mut store = self.store.lock();
        let Store { cache, acks } = &mut *store;
        cache.open_for_writing();
        if caching {
            let held = deferred
                .iter()
                .filter(|m| cache.append_message(m))
                .count();
            let n = acks.drain_to_cache(cache);
            if n + held > 0 {
                tracing::info!(cached = n, held, "moved in-flight messages to cache");
            }
        } else {
            let n = acks.clear() + deferred.len();
            if n > 0 {
                tracing::info!(dropped = n, "caching disabled, dropped in-flight messages");
            }
        }
    }

    fn start_drain(&mut self) -> Option<Action> {
        if self.session.is_none() || self.draining || self.store.lock().cache.is_empty() {
            return None;
        }
        self.drain_epoch += 1;
        self.draining = true;
        tracing::info!(epoch = self.drain_epoch, "draining spillover cache");
        Some(Action::StartDrain(self.drain_epoch))
    }

    fn schedule_reconnect(&mut self) -> Action {
        let delay = self.backoff.next_delay();
        tracing::info!(?delay, "reconnect scheduled");
        Action::ScheduleReconnect(delay)
    }

    fn uptime(&self) -> Body {
        Body::Uptime {
            scanner_started: self.scanner_started.unwrap_or(0),
            system_booted: self.system_booted,
        }
    }

    fn frame(&self, msg: &Message) -> Option<Action> {
        match wire::encode_frame(msg) {
            Ok(bytes) => Some(Action::Send(bytes)),
            Err(e) => {
                tracing::warn!(kind = ?msg.kind(), error = %e, "cannot encode frame");
                None
            }
        }
    }

    /// Control reply; bypasses the feature overlay and is never tracked.
    fn reply(&self, body: Body) -> Option<Action> {
        self.frame(&Message::new(body))
    }

    /// Acknowledge a control request by the checksum of its payload.
    fn ack(&self, request: &[u8]) -> Option<Action> {
        self.reply(Body::Ack {
            checksum: integrity::checksum(request),
        })
    }
}
