//! Serial link. One worker thread owns the port, callers queue commands.
//!
//! ```text
//! Link::send(cmd) → [req_tx] → hoot-link thread: clear input → write → settle → (read line)
//!                 ← [oneshot] ← Result<reply, LinkError>
//! ```
//!
//! The device cannot pipeline, so exactly one frame is in flight at a time:
//! the worker drains a FIFO channel one request at a time. Every request
//! carries a deadline. A caller stops waiting when it passes, and the worker
//! discards requests whose deadline expired while they sat in the queue, so a
//! slow port never releases a backlog of stale frames.
//!
//! The controller reboots when its port opens, so the worker waits
//! `open_grace` after every open. That wait is not charged to the requests
//! pending at the time: both sides extend a request's deadline by any grace
//! that overlaps its wait.
//!
//! Connection state is owned by the worker and published on a watch channel.
//! A write/read failure closes the handle, reopens it with the same settings
//! and leaves the link `Degraded` until a command is delivered again. If the
//! port cannot be opened at all the link stays `Degraded` and every command
//! retries the open before failing with [`LinkError::Unavailable`].

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use hoot_core::protocol::{Command, MotorFrame, decode_line};
use hoot_core::types::{ConnectionState, LinkConfig, LinkEvent};

use crate::error::LinkError;
use crate::serial::{Connector, SerialConnector, Transport};

/// Cloneable handle to the serial link. Cheap to clone, all clones share one worker.
#[derive(Clone)]
pub struct Link {
    req_tx: std_mpsc::Sender<Msg>,
    state_rx: watch::Receiver<ConnectionState>,
    deadline: Duration,
    port: Arc<str>,
    grace: GraceClock,
}

// ─── Internal types ────────────────────────────────────────────────────────

type Reply = Result<Option<String>, LinkError>;

struct Request {
    command: Command,
    enqueued: Instant,
    grace_mark: Duration,
    reply: oneshot::Sender<Reply>,
}

/// Post-open grace the worker has entered, in total and in progress.
#[derive(Clone, Default)]
struct GraceClock(Arc<Mutex<GraceState>>);

#[derive(Default)]
struct GraceState {
    spent: Duration,
    current: Option<Duration>,
}

impl GraceClock {
    /// Reference point for a new request. A grace already under way counts in full.
    fn mark(&self) -> Duration {
        let state = self.lock();
        state.spent.saturating_sub(state.current.unwrap_or_default())
    }

    fn since(&self, mark: Duration) -> Duration {
        self.lock().spent.saturating_sub(mark)
    }

    fn enter(&self, grace: Duration) {
        let mut state = self.lock();
        state.spent = state.spent.saturating_add(grace);
        state.current = Some(grace);
    }

    fn leave(&self) {
        self.lock().current = None;
    }

    fn lock(&self) -> MutexGuard<'_, GraceState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Msg {
    Command(Request),
    Shutdown,
}

// ─── Handle ────────────────────────────────────────────────────────────────

impl Link {
    /// Start the link worker on the configured serial device.
    ///
    /// Failing to open the device is not an error here: the link starts
    /// `Degraded` and keeps retrying on each command.
    pub fn open(config: LinkConfig) -> Result<Self, LinkError> {
        Self::with_connector(config, SerialConnector)
    }

    /// Start the link worker with a custom connector.
    pub fn with_connector(config: LinkConfig, connector: impl Connector) -> Result<Self, LinkError> {
        let (req_tx, req_rx) = std_mpsc::channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let deadline = config.deadline;
        let port: Arc<str> = config.port.as_str().into();
        let grace = GraceClock::default();

        let worker = LinkWorker {
            config,
            connector,
            transport: None,
            state: ConnectionState::Disconnected,
            state_tx,
            grace: grace.clone(),
        };

        // Serial I/O blocks, so the port lives on its own OS thread.
        std::thread::Builder::new()
            .name("hoot-link".into())
            .spawn(move || worker.run(req_rx))
            .map_err(|e| LinkError::Unavailable(format!("failed to spawn link thread: {e}")))?;

        Ok(Self {
            req_tx,
            state_rx,
            deadline,
            port,
            grace,
        })
    }

    /// Send one command. Resolves once the frame is written and settled.
    pub async fn send(&self, command: Command) -> Result<(), LinkError> {
        self.request(command).await.map(|_| ())
    }

    pub async fn set_positions(&self, frame: MotorFrame) -> Result<(), LinkError> {
        self.send(Command::SetPositions(frame)).await
    }

    /// Send `[g]` and return the decoded response line.
    pub async fn query_positions(&self) -> Option<String> {
        match self.request(Command::QueryPositions).await {
            Ok(line) => line,
            Err(e) => {
                warn!("link: position query failed: {e}");
                None
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Close the port and stop the worker. Later commands fail with [`LinkError::Closed`].
    pub fn close(&self) {
        let _ = self.req_tx.send(Msg::Shutdown);
    }

    async fn request(&self, command: Command) -> Reply {
        let label = command.label();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let enqueued = Instant::now();
        let grace_mark = self.grace.mark();
        let request = Request {
            command,
            enqueued,
            grace_mark,
            reply: reply_tx,
        };
        self.req_tx
            .send(Msg::Command(request))
            .map_err(|_| LinkError::Closed)?;

        loop {
            let extension = self.grace.since(grace_mark);
            let until = enqueued + self.deadline + extension;
            match tokio::time::timeout_at(until.into(), &mut reply_rx).await {
                Ok(Ok(reply)) => return reply,
                Ok(Err(_)) => return Err(LinkError::Closed),
                // The port was reopened while we waited.
                Err(_) if self.grace.since(grace_mark) > extension => continue,
                Err(_) => {
                    warn!("link: {label} exceeded {:?} deadline", self.deadline);
                    return Err(LinkError::CommandTimeout(self.deadline));
                }
            }
        }
    }
}

// ─── Worker (hoot-link OS thread) ──────────────────────────────────────────

struct LinkWorker<C: Connector> {
    config: LinkConfig,
    connector: C,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    grace: GraceClock,
}

impl<C: Connector> LinkWorker<C> {
    fn run(mut self, req_rx: std_mpsc::Receiver<Msg>) {
        if !self.connect() {
            error!(
                "link: could not open {}, continuing degraded",
                self.config.port
            );
        }

        while let Ok(msg) = req_rx.recv() {
            let request = match msg {
                Msg::Command(request) => request,
                Msg::Shutdown => break,
            };

            let deadline = self.deadline_of(&request);
            if Instant::now() >= deadline {
                debug!("link: discarding expired {}", request.command.label());
                let _ = request
                    .reply
                    .send(Err(LinkError::CommandTimeout(self.config.deadline)));
                continue;
            }

            let reply = self.execute(&request);
            let _ = request.reply.send(reply);
        }

        self.transport = None;
        self.apply(LinkEvent::Closed);
        info!("link: {} closed", self.config.port);
    }

    /// Queue time plus the configured deadline, not counting open grace.
    fn deadline_of(&self, request: &Request) -> Instant {
        request.enqueued + self.config.deadline + self.grace.since(request.grace_mark)
    }

    fn execute(&mut self, request: &Request) -> Reply {
        let command = request.command;
        self.ensure_open(request)?;
        if Instant::now() >= self.deadline_of(request) {
            return Err(LinkError::CommandTimeout(self.config.deadline));
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::Unavailable(self.config.port.clone()));
        };

        debug!("link: → {}", command);
        match transact(transport.as_mut(), command, self.config.settle) {
            Ok(raw) => {
                self.apply(LinkEvent::Delivered);
                match raw {
                    Some(raw) => {
                        let line = decode_line(&raw)?;
                        debug!("link: ← {line}");
                        Ok(Some(line))
                    }
                    None => Ok(None),
                }
            }
            Err(e) => {
                warn!("link: {} failed: {e}", command.label());
                self.transport = None;
                self.apply(LinkEvent::Fault);
                self.connect();
                Err(e.into())
            }
        }
    }

    /// Reopen the port if needed, up to `reconnect_attempts` times within the deadline.
    fn ensure_open(&mut self, request: &Request) -> Result<(), LinkError> {
        if self.transport.is_some() {
            return Ok(());
        }

        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.connect() {
                return Ok(());
            }
            let backoff = self.config.reconnect_backoff;
            if attempt == attempts || Instant::now() + backoff >= self.deadline_of(request) {
                break;
            }
            std::thread::sleep(backoff);
        }

        Err(LinkError::Unavailable(format!(
            "cannot open {}",
            self.config.port
        )))
    }

    fn connect(&mut self) -> bool {
        match self.connector.connect(&self.config) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.apply(LinkEvent::Opened);
                info!(
                    "link: opened {} at {} baud",
                    self.config.port, self.config.baud_rate
                );
                // The controller reboots when the port opens.
                if !self.config.open_grace.is_zero() {
                    self.grace.enter(self.config.open_grace);
                    std::thread::sleep(self.config.open_grace);
                    self.grace.leave();
                }
                true
            }
            Err(e) => {
                warn!("link: open {} failed: {e}", self.config.port);
                self.apply(LinkEvent::OpenFailed);
                false
            }
        }
    }

    fn apply(&mut self, event: LinkEvent) {
        let next = self.state.on(event);
        if next != self.state {
            info!("link: {:?} → {:?}", self.state, next);
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

/// One exchange: clear stale input, write, settle, then read the reply if one is expected.
fn transact(
    transport: &mut dyn Transport,
    command: Command,
    settle: Duration,
) -> std::io::Result<Option<Vec<u8>>> {
    transport.clear_input()?;
    transport.write_frame(command.encode().as_bytes())?;
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    if command.expects_reply() {
        transport.read_line().map(Some)
    } else {
        Ok(None)
    }
}
