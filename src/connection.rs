//! Control-channel connection lifecycle.
//!
//! `ConnectionManager` keeps exactly one logical connection to the rover. A
//! supervisor thread looks at the current `ConnectionState` every retry
//! interval and dials only while it is `Disconnected`. Once connected, a link
//! thread becomes the single owner of the socket: it writes queued outbound
//! messages, forwards inbound text to the status sink, and on any read failure
//! tears the link down and flips the state back to `Disconnected`. The
//! supervisor picks that up on its next tick, so a dropped link is redialled
//! within one retry interval. Reconnection is level-triggered, and a new
//! attempt can only start after the previous link is gone.
//!
//! The link thread sleeps on its outbound queue, not on the socket. Reads are
//! non-blocking polls between waits, so a queued command is written as soon
//! as it arrives and inbound text is picked up within `poll_interval`.
//!
//! Nothing outside this module mutates the state or touches the socket.
//! Senders go through `LinkHandle`, which hands text to the link thread and
//! waits (bounded) for the write result.

use anyhow::{anyhow, bail, Context, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tungstenite::protocol::WebSocket;
use tungstenite::Message;
use url::Url;

use crate::status::StatusSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One established bidirectional message connection.
pub trait ControlLink: Send {
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Take one inbound message if one is ready. Must not block.
    fn poll_message(&mut self) -> Result<Option<String>>;

    fn close(&mut self);
}

/// Dials new links.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> Result<Box<dyn ControlLink>>;

    /// Endpoint description for status messages.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Pause between supervisor checks (and therefore between retries).
    pub retry_interval: Duration,
    /// How long a sender waits for the link thread to report a write.
    pub send_timeout: Duration,
    /// Longest gap between inbound polls on an idle link.
    pub poll_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(500),
            send_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct Outbound {
    text: String,
    reply: SyncSender<Result<()>>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    outbound: Mutex<Option<Sender<Outbound>>>,
    shutdown: AtomicBool,
    connects: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
        self.state_changed.notify_all();
    }
}

// A panicked thread must not take every other holder down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap, cloneable view of the managed connection for senders.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
    send_timeout: Duration,
}

impl LinkHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Block until the connection reaches `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = lock(&self.shared.state);
        while *current != state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            current = match self.shared.state_changed.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Hand `text` to the link thread and wait for the write outcome.
    pub fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            bail!("control channel not connected");
        }
        let tx = lock(&self.shared.outbound)
            .clone()
            .ok_or_else(|| anyhow!("control channel not connected"))?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        tx.send(Outbound {
            text: text.to_string(),
            reply: reply_tx,
        })
        .map_err(|_| anyhow!("control channel closed"))?;
        match reply_rx.recv_timeout(self.send_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => bail!(
                "control channel write not confirmed within {:?}",
                self.send_timeout
            ),
            Err(RecvTimeoutError::Disconnected) => bail!("control channel closed"),
        }
    }
}

pub struct ConnectionManager {
    handle: LinkHandle,
    shutdown_tx: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start supervising a connection made by `connector`.
    pub fn spawn<C: Connector>(
        connector: C,
        settings: ConnectionSettings,
        sink: StatusSink,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            state_changed: Condvar::new(),
            outbound: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            connects: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let supervisor_shared = shared.clone();
        let timing = settings.clone();
        let supervisor = std::thread::Builder::new()
            .name("control-supervisor".to_string())
            .spawn(move || supervise(connector, supervisor_shared, sink, timing, shutdown_rx))
            .context("spawn control supervisor thread")?;

        Ok(Self {
            handle: LinkHandle {
                shared,
                send_timeout: settings.send_timeout,
            },
            shutdown_tx: Some(shutdown_tx),
            supervisor: Some(supervisor),
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Stop supervising, close the link, and wait for both threads to exit.
    ///
    /// Returns promptly while connected or idle. While a dial is in flight it
    /// waits for that attempt, which `WsConnector` bounds by its
    /// `connect_timeout` (TCP connect and handshake together).
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.handle.shared.shutdown.store(true, Ordering::SeqCst);
        // Dropping the senders wakes the supervisor out of its retry wait and
        // the link thread out of its outbound wait.
        drop(self.shutdown_tx.take());
        *lock(&self.handle.shared.outbound) = None;
        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .join()
                .map_err(|_| anyhow!("control supervisor thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("control channel shutdown failed: {}", err);
        }
    }
}

fn supervise<C: Connector>(
    mut connector: C,
    shared: Arc<Shared>,
    sink: StatusSink,
    timing: ConnectionSettings,
    shutdown_rx: Receiver<()>,
) {
    let mut link_thread: Option<JoinHandle<()>> = None;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if shared.state() == ConnectionState::Disconnected {
            // The previous link thread set Disconnected as its last act.
            join_link_thread(&mut link_thread);
            shared.set_state(ConnectionState::Connecting);
            match connector.connect() {
                Ok(link) => {
                    let (tx, rx) = mpsc::channel();
                    *lock(&shared.outbound) = Some(tx);
                    shared.connects.fetch_add(1, Ordering::SeqCst);
                    shared.set_state(ConnectionState::Connected);
                    sink.status(format!("connected to {}", connector.describe()));

                    let link_shared = shared.clone();
                    let link_sink = sink.clone();
                    let poll_interval = timing.poll_interval;
                    let spawned = std::thread::Builder::new()
                        .name("control-link".to_string())
                        .spawn(move || run_link(link, rx, link_shared, link_sink, poll_interval));
                    match spawned {
                        Ok(handle) => link_thread = Some(handle),
                        Err(err) => {
                            log::error!("failed to spawn control link thread: {}", err);
                            *lock(&shared.outbound) = None;
                            shared.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(err) => {
                    shared.set_state(ConnectionState::Disconnected);
                    sink.status(format!(
                        "control channel error ({}): {:#}",
                        connector.describe(),
                        err
                    ));
                }
            }
        }
        match shutdown_rx.recv_timeout(timing.retry_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.shutdown.store(true, Ordering::SeqCst);
    join_link_thread(&mut link_thread);
    shared.set_state(ConnectionState::Disconnected);
}

fn join_link_thread(link_thread: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = link_thread.take() {
        if handle.join().is_err() {
            log::error!("control link thread panicked");
        }
    }
}

fn write_outbound(link: &mut dyn ControlLink, message: Outbound) {
    let result = link.send_text(&message.text);
    if let Err(err) = &result {
        log::warn!("control channel write failed: {:#}", err);
    }
    let _ = message.reply.send(result);
}

fn run_link(
    mut link: Box<dyn ControlLink>,
    outbound: Receiver<Outbound>,
    shared: Arc<Shared>,
    sink: StatusSink,
    poll_interval: Duration,
) {
    let failure = loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break None;
        }
        let wait = match link.poll_message() {
            Ok(Some(text)) => {
                sink.telemetry(text);
                Duration::ZERO
            }
            Ok(None) => poll_interval,
            Err(err) => break Some(err),
        };
        match outbound.recv_timeout(wait) {
            Ok(message) => {
                write_outbound(link.as_mut(), message);
                while let Ok(message) = outbound.try_recv() {
                    write_outbound(link.as_mut(), message);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Only `stop` drops the sender while the link is up.
            Err(RecvTimeoutError::Disconnected) => break None,
        }
    };

    *lock(&shared.outbound) = None;
    link.close();
    for message in outbound.try_iter() {
        let _ = message.reply.send(Err(anyhow!("control channel closed")));
    }
    if let Some(err) = failure {
        sink.status(format!("control channel lost: {:#}", err));
    }
    shared.set_state(ConnectionState::Disconnected);
}

/// Dials the rover's WebSocket endpoint.
///
/// One attempt (TCP connect plus handshake) takes at most `connect_timeout`.
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("parse control url '{}'", url))?;
        if url.scheme() != "ws" {
            bail!(
                "unsupported control channel scheme '{}'; expected ws",
                url.scheme()
            );
        }
        if url.host_str().is_none() {
            bail!("control url '{}' has no host", url);
        }
        Ok(Self {
            url,
            connect_timeout,
        })
    }
}

impl Connector for WsConnector {
    fn connect(&mut self) -> Result<Box<dyn ControlLink>> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| anyhow!("control url missing host"))?;
        let port = self
            .url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("control url missing port"))?;
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow!("{}:{} resolved to no addresses", host, port))?;

        let deadline = Instant::now() + self.connect_timeout;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("connect to {}", addr))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        // The handshake gets whatever is left of the attempt's budget.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("connect to {} timed out before the handshake", addr);
        }
        stream
            .set_read_timeout(Some(remaining))
            .context("set handshake read timeout")?;
        stream
            .set_write_timeout(Some(remaining))
            .context("set handshake write timeout")?;

        let (socket, _response) = tungstenite::client(self.url.as_str(), stream)
            .map_err(|err| anyhow!("websocket handshake with {} failed: {}", self.url, err))?;
        socket
            .get_ref()
            .set_nonblocking(true)
            .context("switch control socket to non-blocking")?;
        Ok(Box::new(WsLink { socket }))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

struct WsLink {
    socket: WebSocket<TcpStream>,
}

impl ControlLink for WsLink {
    fn send_text(&mut self, text: &str) -> Result<()> {
        match self.socket.send(Message::text(text)) {
            Ok(()) => Ok(()),
            // Queued inside tungstenite; the next read flushes it.
            Err(tungstenite::Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Ok(())
            }
            Err(err) => Err(err).context("write to control channel"),
        }
    }

    fn poll_message(&mut self) -> Result<Option<String>> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text.to_string())),
            Ok(Message::Binary(bytes)) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(Message::Close(_)) => bail!("rover closed the control channel"),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err).context("read from control channel"),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}
