//! Event loop: feeds RelayCore from the local listener, the uplink, timers, the drain worker
//! and signals, then performs the actions it returns.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scanrelay_core::{
    AckTracker, Action, CacheError, DrainStep, Drainer, Event, ExitStatus, Message, RelayConfig,
    RelayCore, SharedStore, SpilloverCache, Store,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::Config;
use crate::indicator::Indicator;
use crate::listener::ListenError;
use crate::uplink::{self, LinkEvent, Target};
use crate::{listener, tls, uptime};

/// Keepalive deadline and cache size are checked this often.
const SUPERVISE_PERIOD: Duration = Duration::from_secs(1);
const DRAIN_THROTTLE: Duration = Duration::from_secs(1);
const DRAIN_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the spawned tasks report to the loop.
#[derive(Debug)]
pub enum Input {
    Line(String),
    Link(u64, LinkEvent),
}

enum DrainOutput {
    Batch(Vec<Message>),
    Finished(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid server_host: {0}")]
    ServerName(String),
    #[error(transparent)]
    Listen(ListenError),
}

struct Link {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    tasks: [JoinHandle<()>; 2],
}

impl Link {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Drain {
    epoch: u64,
    cancel: Arc<AtomicBool>,
}

/// Run until SIGINT/SIGTERM or a fatal error.
pub async fn run(cfg: Config) -> Result<ExitStatus, StartupError> {
    run_until(cfg, shutdown_signal()).await
}

/// Startup order: credentials, then the local port, then the first outbound attempt.
pub async fn run_until(
    cfg: Config,
    shutdown: impl Future<Output = ()>,
) -> Result<ExitStatus, StartupError> {
    let target = if cfg.uplink_enabled() {
        let tls = match tls::client_config(&cfg) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "transport credentials unavailable");
                return Ok(ExitStatus::CredentialsMissing);
            }
        };
        let target = Target {
            host: cfg.server_host.trim().to_string(),
            port: cfg.server_port,
            tls,
        };
        target
            .server_name()
            .map_err(|e| StartupError::ServerName(e.to_string()))?;
        Some(target)
    } else {
        None
    };

    let local = match listener::bind(cfg.local_port).await {
        Ok(l) => l,
        Err(e) => return bind_failed(e),
    };

    let cache = SpilloverCache::open(&cfg.cache_path, cfg.cache_max_bytes())?;
    tracing::info!(
        path = %cfg.cache_path.display(),
        size = cache.size(),
        full = cache.is_full(),
        "spillover cache opened"
    );
    let store = Store::new(cache, AckTracker::with_threshold(cfg.resend_threshold)).into_shared();
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let mut core = RelayCore::new(
        RelayConfig {
            hostname,
            caching: cfg.caching,
            ack_interval: cfg.ack_interval(),
            reconnect_min: cfg.reconnect_min(),
            reconnect_max: cfg.reconnect_max(),
        },
        store.clone(),
    );
    if let Some(booted) = uptime::system_booted() {
        core.set_system_booted(booted);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let listener_task = tokio::spawn(listener::run(local, tx.clone()));
    let (drain_tx, drain_rx) = mpsc::channel(1);
    let mut relay = Runtime {
        core,
        store,
        target,
        tx,
        rx,
        drain_tx,
        drain_rx,
        indicator: Indicator::new(cfg.indicator_path.clone()),
        pending: VecDeque::new(),
        link: None,
        attempt: 0,
        ack_timer: None,
        keepalive_timer: None,
        reconnect_at: None,
        drain: None,
    };
    let status = relay.run(shutdown).await;
    listener_task.abort();
    Ok(status)
}

struct Runtime {
    core: RelayCore,
    store: SharedStore,
    target: Option<Target>,
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
    /// Capacity 1: the drain worker blocks until the loop takes its batch.
    drain_tx: mpsc::Sender<DrainOutput>,
    drain_rx: mpsc::Receiver<DrainOutput>,
    indicator: Indicator,
    pending: VecDeque<Event>,
    link: Option<Link>,
    /// Id of the latest connect attempt; link events with another id are stale.
    attempt: u64,
    ack_timer: Option<Interval>,
    keepalive_timer: Option<Interval>,
    reconnect_at: Option<Instant>,
    drain: Option<Drain>,
}

impl Runtime {
    async fn run(&mut self, shutdown: impl Future<Output = ()>) -> ExitStatus {
        tokio::pin!(shutdown);
        let mut signalled = false;
        let mut supervise = tokio::time::interval(SUPERVISE_PERIOD);
        supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.target.is_some() {
            let actions = self.core.start();
            if let Some(status) = self.perform_all(actions).await {
                return status;
            }
        } else {
            tracing::info!("server_host not set, uplink disabled");
        }

        loop {
            while let Some(event) = self.pending.pop_front() {
                let actions = self.core.handle(event);
                if let Some(status) = self.perform_all(actions).await {
                    return status;
                }
            }

            let event = tokio::select! {
                _ = &mut shutdown, if !signalled => {
                    signalled = true;
                    Event::Shutdown
                }
                Some(input) = self.rx.recv() => match self.translate(input) {
                    Some(event) => event,
                    None => continue,
                },
                Some(out) = self.drain_rx.recv() => match out {
                    DrainOutput::Batch(messages) => Event::Replay(messages),
                    DrainOutput::Finished(epoch) => {
                        if self.drain.as_ref().is_some_and(|d| d.epoch == epoch) {
                            self.drain = None;
                        }
                        Event::DrainFinished(epoch)
                    }
                },
                _ = tick(&mut self.ack_timer) => Event::AckTimer,
                _ = tick(&mut self.keepalive_timer) => Event::KeepaliveTimer,
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    Event::ReconnectTimer
                }
                _ = supervise.tick() => Event::Supervise(std::time::Instant::now()),
            };
            self.pending.push_back(event);
        }
    }

    fn translate(&mut self, input: Input) -> Option<Event> {
        let (id, event) = match input {
            Input::Line(line) => return Some(Event::LocalLine(line)),
            Input::Link(id, event) => (id, event),
        };
        if id != self.attempt {
            tracing::debug!(id, ?event, "stale uplink event");
            return None;
        }
        match event {
            LinkEvent::Opened(stream) => {
                self.open_link(id, *stream);
                Some(Event::Connected(std::time::Instant::now()))
            }
            LinkEvent::Failed(err) => Some(Event::ConnectFailed(err)),
            LinkEvent::Frame(payload) => self.link.as_ref().map(|_| Event::Frame {
                payload,
                at: std::time::Instant::now(),
            }),
            LinkEvent::Closed(reason) => {
                let link = self.link.take()?;
                tracing::info!(%reason, "uplink closed");
                link.abort();
                Some(Event::Disconnected)
            }
            LinkEvent::Rejected(err) => {
                if let Some(link) = self.link.take() {
                    link.abort();
                }
                Some(Event::ConnectFailed(err))
            }
        }
    }

    fn open_link<S>(&mut self, id: u64, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let read = tokio::spawn(uplink::read_frames(reader, id, self.tx.clone()));
        let write = tokio::spawn(uplink::write_frames(writer, id, frames_rx, self.tx.clone()));
        self.link = Some(Link {
            frames,
            tasks: [read, write],
        });
    }

    async fn perform_all(&mut self, actions: Vec<Action>) -> Option<ExitStatus> {
        for action in actions {
            if let Some(status) = self.perform(action).await {
                return Some(status);
            }
        }
        None
    }

    async fn perform(&mut self, action: Action) -> Option<ExitStatus> {
        match action {
            Action::Send(frame) => match &self.link {
                Some(link) => {
                    if link.frames.send(frame).is_err() {
                        tracing::debug!("uplink writer gone, frame dropped");
                    }
                }
                None => tracing::debug!("no uplink, frame dropped"),
            },
            Action::Connect => self.connect(),
            Action::ScheduleReconnect(delay) => self.reconnect_at = Some(Instant::now() + delay),
            Action::CloseTransport => {
                if let Some(link) = self.link.take() {
                    link.abort();
                    self.pending.push_back(Event::Disconnected);
                }
            }
            Action::SetAckTimer(period) => self.ack_timer = period.map(periodic),
            Action::SetKeepaliveTimer(period) => self.keepalive_timer = period.map(periodic),
            Action::StartDrain(epoch) => self.start_drain(epoch),
            Action::CancelDrain => {
                if let Some(drain) = &self.drain {
                    drain.cancel.store(true, Ordering::Release);
                }
            }
            Action::Indicator(on) => self.indicator.set(on),
            Action::Exit(status) => {
                self.finish().await;
                tracing::info!(code = status.code(), "relay exiting");
                return Some(status);
            }
        }
        None
    }

    fn connect(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.attempt += 1;
        let id = self.attempt;
        let tx = self.tx.clone();
        tracing::debug!(host = %target.host, port = target.port, id, "connecting");
        tokio::spawn(async move {
            let event = match uplink::connect(&target).await {
                Ok(stream) => LinkEvent::Opened(Box::new(stream)),
                Err(e) => LinkEvent::Failed(e),
            };
            let _ = tx.send(Input::Link(id, event));
        });
    }

    fn start_drain(&mut self, epoch: u64) {
        let cancel = Arc::new(AtomicBool::new(false));
        let previous = self.drain.replace(Drain {
            epoch,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.store(true, Ordering::Release);
        }
        let store = self.store.clone();
        let out = self.drain_tx.clone();
        tokio::task::spawn_blocking(move || {
            let drainer = Drainer::new(store, cancel);
            loop {
                match drainer.step() {
                    DrainStep::Batch(messages) => {
                        if out.blocking_send(DrainOutput::Batch(messages)).is_err() {
                            break;
                        }
                    }
                    DrainStep::Throttled => std::thread::sleep(DRAIN_THROTTLE),
                    DrainStep::Done | DrainStep::Cancelled => break,
                }
            }
            let _ = out.blocking_send(DrainOutput::Finished(epoch));
        });
    }

    /// Stop the uplink and route records the drain worker already popped back to the cache.
    async fn finish(&mut self) {
        if let Some(link) = self.link.take() {
            link.abort();
        }
        let Some(drain) = self.drain.take() else {
            return;
        };
        drain.cancel.store(true, Ordering::Release);
        let settle = async {
            while let Some(out) = self.drain_rx.recv().await {
                match out {
                    DrainOutput::Batch(messages) => {
                        self.core.handle(Event::Replay(messages));
                    }
                    DrainOutput::Finished(epoch) if epoch == drain.epoch => break,
                    DrainOutput::Finished(_) => {}
                }
            }
        };
        if tokio::time::timeout(DRAIN_SETTLE_TIMEOUT, settle).await.is_err() {
            tracing::warn!("drain worker did not stop in time");
        }
    }
}

/// Only a port held by another process is exit 1; other bind errors are configuration errors.
fn bind_failed(err: ListenError) -> Result<ExitStatus, StartupError> {
    match err {
        ListenError::InUse(port) => {
            tracing::error!(port, "local port in use; is another relay running?");
            Ok(ExitStatus::PortInUse)
        }
        other => Err(StartupError::Listen(other)),
    }
}

fn periodic(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn config(dir: &tempfile::TempDir, local_port: u16) -> Config {
        Config {
            local_port,
            cache_path: dir.path().join("spill.bin"),
            client_cert: dir.path().join("client.crt"),
            client_key: dir.path().join("client.key"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn port_in_use_exits_with_code_1() {
        let dir = tempfile::tempdir().unwrap();
        let held = listener::bind(0).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let status = run_until(config(&dir, port), std::future::pending())
            .await
            .unwrap();
        assert_eq!(status, ExitStatus::PortInUse);
        assert_eq!(status.code(), 1);
        assert!(!dir.path().join("spill.bin").exists());
    }

    #[test]
    fn other_bind_errors_are_not_port_in_use() {
        let denied = ListenError::Bind {
            port: 80,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(matches!(
            bind_failed(denied),
            Err(StartupError::Listen(ListenError::Bind { port: 80, .. }))
        ));
        assert_eq!(
            bind_failed(ListenError::InUse(25830)).unwrap(),
            ExitStatus::PortInUse
        );
    }

    #[tokio::test]
    async fn credentials_checked_before_bind() {
        let dir = tempfile::tempdir().unwrap();
        let held = listener::bind(0).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let cfg = Config {
            server_host: "collector.example".into(),
            ..config(&dir, port)
        };
        let status = run_until(cfg, std::future::pending()).await.unwrap();
        assert_eq!(status, ExitStatus::CredentialsMissing);
        assert_eq!(status.code(), 2);
    }

    #[tokio::test]
    async fn offline_lines_cached_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let probe = listener::bind(0).await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let relay = tokio::spawn(run_until(config(&dir, port), async {
            let _ = stop_rx.await;
        }));

        let mut client = None;
        for _ in 0..100 {
            if let Ok(c) = TcpStream::connect(("127.0.0.1", port)).await {
                client = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut client = client.expect("relay listening");
        client
            .write_all(b"BLUETOOTH_IO,00:11:22:33:44:55,1.5,aa:bb:cc:dd:ee:ff,5898500,in\n")
            .await
            .unwrap();

        let cache = dir.path().join("spill.bin");
        let mut cached = false;
        for _ in 0..100 {
            if std::fs::metadata(&cache).map(|m| m.len() > 0).unwrap_or(false) {
                cached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cached, "line should reach the spillover cache");

        stop_tx.send(()).unwrap();
        assert_eq!(relay.await.unwrap().unwrap(), ExitStatus::Normal);
    }
}
