//! Connection manager and public client surface.
//!
//! DESIGN
//! ======
//! One [`Client`] owns at most one gateway socket. `connect()` walks
//! Idle → Authenticating → Opening → Open: it probes the login path for a
//! digest challenge, answers it on the socket upgrade, then spawns a socket
//! task that runs a `select!` loop over inbound frames and the outbound
//! queue. All writes go through that queue, so there is a single writer.
//!
//! Inbound frames are decoded and routed:
//! - a `transac-id` matching a pending request settles that request
//! - anything else is handed to command follow-up subscribers and then
//!   broadcast as [`ClientEvent::Message`]
//!
//! LIFECYCLE
//! =========
//! When the socket ends, every pending request is rejected, follow-up
//! subscriptions are closed and [`ClientEvent::Disconnect`] is emitted. Unless
//! the close was requested through [`Client::close`] or [`Client::shutdown`],
//! a reconnect loop retries with exponential backoff. The attempt counter is
//! only cleared after a connection has stayed open for a full minute.
//!
//! A request that hits its timeout is treated as a sign that the link is dead:
//! the request fails and the socket is closed, which starts the reconnect loop.
//!
//! Background tasks hold `Weak` references, so dropping the last `Client`
//! clone tears everything down.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use frames::{HttpMessage, Method, ProtocolMessage, TRANSACTION_HEADER, Transport};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue, USER_AGENT};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, warn};

use crate::aggregator::{self, FollowUpRouter};
use crate::auth::{self, DigestAuthenticator};
use crate::backoff;
use crate::config::ClientConfig;
use crate::correlator::{Correlator, Reply};
use crate::error::ClientError;
use crate::tls;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const PING_URI: &str = "/ping";
const EVENT_CAPACITY: usize = 256;
/// How long a locally initiated close waits for the peer's close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

static COMMAND_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/devices/(\d+)/endpoints/(\d+)/cdata\?name=(\w*)").expect("valid command uri regex")
});

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Socket lifecycle as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Notification broadcast to [`Client::subscribe`] receivers.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    /// A message that answered no pending request, typically a device push.
    Message(HttpMessage),
}

/// Handle to a gateway connection. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct SocketHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Receiver<bool>,
}

#[derive(Default)]
struct Timers {
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    success_reset: Option<JoinHandle<()>>,
}

struct Status {
    state: ConnectionState,
    opened_at: Option<Instant>,
}

struct Inner {
    config: ClientConfig,
    transport: Transport,
    authenticator: DigestAuthenticator,
    http: reqwest::Client,
    status: Mutex<Status>,
    attempts: AtomicU32,
    generation: AtomicU64,
    correlator: Mutex<Correlator>,
    follow_ups: FollowUpRouter,
    socket: Mutex<Option<SocketHandle>>,
    timers: Mutex<Timers>,
    events: broadcast::Sender<ClientEvent>,
    intentional_close: AtomicBool,
    shutting_down: AtomicBool,
    success_reset: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn replace_timer(slot: &mut Option<JoinHandle<()>>, handle: Option<JoinHandle<()>>) {
    if let Some(previous) = std::mem::replace(slot, handle) {
        previous.abort();
    }
}

// =============================================================================
// PUBLIC SURFACE
// =============================================================================

impl Client {
    /// Build a client; no I/O happens until [`Client::connect`].
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_success_reset(config, backoff::SUCCESS_RESET)
    }

    pub(crate) fn with_success_reset(config: ClientConfig, success_reset: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            transport: config.transport(),
            authenticator: DigestAuthenticator::new(config.username.clone(), config.password.clone()),
            config,
            http,
            status: Mutex::new(Status { state: ConnectionState::Idle, opened_at: None }),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            correlator: Mutex::new(Correlator::new()),
            follow_ups: FollowUpRouter::new(),
            socket: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            events,
            intentional_close: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            success_reset,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Authenticate and open the socket. Resolves once the socket is open.
    ///
    /// Calling this while a socket is already open is a no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if lock(&self.inner.socket).is_some() {
            debug!(hostname = %self.inner.config.hostname, "socket: already connected");
            return Ok(());
        }
        self.inner.intentional_close.store(false, Ordering::SeqCst);
        replace_timer(&mut lock(&self.inner.timers).reconnect, None);
        self.inner.connect().await
    }

    /// Close the socket without reconnecting afterwards.
    pub fn close(&self) {
        self.inner.intentional_close.store(true, Ordering::SeqCst);
        {
            let mut timers = lock(&self.inner.timers);
            replace_timer(&mut timers.keepalive, None);
            replace_timer(&mut timers.reconnect, None);
        }
        if !self.inner.force_close() {
            // An aborted reconnect may have stopped mid-handshake.
            self.inner.set_state(ConnectionState::Closed);
            debug!(hostname = %self.inner.config.hostname, "socket: close requested without a socket");
        }
    }

    /// Close the socket and wait for the close handshake to finish.
    ///
    /// Only the first call does anything; the client stays closed afterwards.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(hostname = %self.inner.config.hostname, "socket: shutting down");
        self.close();
        let closed = lock(&self.inner.socket).as_ref().map(|socket| socket.closed.clone());
        if let Some(mut closed) = closed {
            let _ = closed.wait_for(|closed| *closed).await;
        }
    }

    pub async fn get(&self, uri: &str) -> Result<Value, ClientError> {
        self.inner.request(Method::Get, uri, "").await.map(|message| message.body)
    }

    pub async fn delete(&self, uri: &str) -> Result<Value, ClientError> {
        self.inner.request(Method::Delete, uri, "").await.map(|message| message.body)
    }

    /// Send a PUT; a missing body is sent as `{}`.
    pub async fn put(&self, uri: &str, body: Option<&Value>) -> Result<Value, ClientError> {
        let body = encode_body(body)?;
        self.inner.request(Method::Put, uri, &body).await.map(|message| message.body)
    }

    /// Send a POST; a missing body is sent as `{}`.
    pub async fn post(&self, uri: &str, body: Option<&Value>) -> Result<Value, ClientError> {
        let body = encode_body(body)?;
        self.inner.request(Method::Post, uri, &body).await.map(|message| message.body)
    }

    /// Run a polling command and gather the `values` of its follow-ups.
    ///
    /// Only `/devices/<id>/endpoints/<id>/cdata?name=<name>` uris are
    /// accepted. Collection ends once follow-ups stay quiet for the debounce
    /// period, or when the command ceiling passes. The ceiling also bounds the
    /// wait for the initial reply.
    pub async fn command(&self, uri: &str) -> Result<Vec<Value>, ClientError> {
        if !COMMAND_URI.is_match(uri) {
            return Err(ClientError::InvalidCommandUri(uri.to_owned()));
        }
        let ceiling = Instant::now() + self.inner.config.command_ceiling();
        let id = lock(&self.inner.correlator).next_transaction_id();
        let subscription = self.inner.follow_ups.subscribe(&id);
        let initial = self.inner.request_with_id(Method::Get, uri, "", id.clone());
        if let Ok(reply) = timeout_at(ceiling, initial).await {
            reply?;
        } else {
            lock(&self.inner.correlator).remove(&id);
            warn!(transaction_id = %id, %uri, "socket: command ceiling passed before the initial reply");
        }
        Ok(aggregator::collect(subscription, self.inner.config.follow_up_debounce, ceiling).await)
    }

    /// Receive connect, disconnect and unsolicited message events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.status).state
    }

    /// Consecutive failed or dropped connections since the last stable one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// How long the current socket has been open.
    #[must_use]
    pub fn connected_for(&self) -> Option<Duration> {
        lock(&self.inner.status).opened_at.map(|at| at.elapsed())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("hostname", &self.inner.config.hostname)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

fn encode_body(body: Option<&Value>) -> Result<String, ClientError> {
    match body {
        Some(value) => Ok(serde_json::to_string(value)?),
        None => Ok("{}".to_owned()),
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let mut status = lock(&self.status);
        status.state = state;
        status.opened_at = (state == ConnectionState::Open).then(Instant::now);
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn may_reconnect(&self) -> bool {
        self.config.retry_on_close
            && !self.intentional_close.load(Ordering::SeqCst)
            && !self.shutting_down.load(Ordering::SeqCst)
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.set_state(ConnectionState::Closed);
                warn!(hostname = %self.config.hostname, attempts, error = %err, "socket: connect failed");
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        let hostname = &self.config.hostname;
        self.set_state(ConnectionState::Authenticating);
        let challenge = auth::fetch_challenge(&self.http, &self.config).await?;
        let authorization = self.authenticator.authorize(&challenge);

        self.set_state(ConnectionState::Opening);
        info!(%hostname, "socket: opening");
        let mut request = self.config.socket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&authorization.header)?);
        headers.insert(USER_AGENT, HeaderValue::from_str(&self.config.user_agent)?);

        let connector = if self.config.secure && self.config.accept_invalid_certs {
            Some(tls::insecure_connector()?)
        } else {
            None
        };
        let (stream, _) = connect_async_tls_with_config(request, None, false, connector).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        *lock(&self.socket) = Some(SocketHandle { generation, outbound: outbound_tx, closed: closed_rx });
        self.set_state(ConnectionState::Open);
        info!(%hostname, generation, transport = ?self.transport, "socket: open");

        tokio::spawn(run_socket(Arc::downgrade(self), generation, stream, outbound_rx, closed_tx));
        self.arm_open_timers();
        self.emit(ClientEvent::Connect);
        Ok(())
    }

    fn arm_open_timers(self: &Arc<Self>) {
        let keepalive = self.config.keep_alive.then(|| {
            let period = self.config.keep_alive_period();
            debug!(?period, "socket: keepalive armed");
            tokio::spawn(keepalive(Arc::downgrade(self), period))
        });

        let weak = Arc::downgrade(self);
        let hold = self.success_reset;
        let success_reset = tokio::spawn(async move {
            sleep(hold).await;
            if let Some(inner) = weak.upgrade() {
                let previous = inner.attempts.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    info!(hostname = %inner.config.hostname, previous, "socket: stable, attempt counter reset");
                }
            }
        });

        let mut timers = lock(&self.timers);
        replace_timer(&mut timers.keepalive, keepalive);
        replace_timer(&mut timers.success_reset, Some(success_reset));
    }

    /// Ask the socket task to close. Returns false when there is no socket.
    fn force_close(&self) -> bool {
        let guard = lock(&self.socket);
        let Some(socket) = guard.as_ref() else {
            return false;
        };
        socket.outbound.send(Outbound::Close).is_ok()
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        {
            let mut socket = lock(&self.socket);
            if socket.as_ref().is_none_or(|current| current.generation != generation) {
                return;
            }
            *socket = None;
        }
        {
            let mut timers = lock(&self.timers);
            replace_timer(&mut timers.keepalive, None);
            replace_timer(&mut timers.success_reset, None);
        }
        self.set_state(ConnectionState::Closed);

        let rejected = lock(&self.correlator).reject_all();
        let detached = self.follow_ups.detach_all();
        info!(hostname = %self.config.hostname, generation, rejected, detached, "socket: closed");

        let reconnect = self.may_reconnect();
        if reconnect {
            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(attempts, "socket: scheduling reconnect");
        }
        self.emit(ClientEvent::Disconnect);
        if reconnect {
            let handle = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
            replace_timer(&mut lock(&self.timers).reconnect, Some(handle));
        }
    }

    // =========================================================================
    // FRAMES
    // =========================================================================

    fn handle_frame(&self, frame: &[u8]) {
        let payload = self.transport.inbound(frame);
        debug!(size = frame.len(), "socket: frame received");
        match frames::decode_message(payload) {
            Ok(ProtocolMessage::Http(message)) => self.route(message),
            Ok(ProtocolMessage::Binary(bytes)) => {
                debug!(size = bytes.len(), "socket: ignoring binary frame");
            }
            Err(err) => {
                warn!(error = %err, size = frame.len(), "socket: dropping undecodable frame");
            }
        }
    }

    fn route(&self, message: HttpMessage) {
        let outcome = lock(&self.correlator).resolve(message);
        let Err(unmatched) = outcome else {
            return;
        };
        let followers = self.follow_ups.deliver(&unmatched);
        debug!(
            uri = %unmatched.uri,
            transaction_id = unmatched.transaction_id().unwrap_or_default(),
            followers,
            "socket: unsolicited message"
        );
        self.emit(ClientEvent::Message(unmatched));
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    async fn request(self: &Arc<Self>, method: Method, uri: &str, body: &str) -> Result<HttpMessage, ClientError> {
        let id = lock(&self.correlator).next_transaction_id();
        self.request_with_id(method, uri, body, id).await
    }

    async fn request_with_id(
        self: &Arc<Self>,
        method: Method,
        uri: &str,
        body: &str,
        id: String,
    ) -> Result<HttpMessage, ClientError> {
        let reply = self.send_request(method, uri, body, id.clone())?;
        await_reply(reply, id).await
    }

    /// Register a pending request and queue its frame. The returned receiver
    /// settles with the reply, a timeout or the socket closing.
    fn send_request(
        self: &Arc<Self>,
        method: Method,
        uri: &str,
        body: &str,
        id: String,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let outbound = self.outbound()?;
        let headers = [
            ("content-length", body.len().to_string()),
            ("content-type", JSON_CONTENT_TYPE.to_owned()),
            (TRANSACTION_HEADER, id.clone()),
        ];
        let raw = frames::encode_request(method, uri, &headers, body);
        debug!(transaction_id = %id, request = %raw.replace("\r\n", "\\r\\n"), "socket: writing request");

        let (reply_tx, reply_rx) = oneshot::channel::<Reply>();
        {
            let mut correlator = lock(&self.correlator);
            let timer = self
                .config
                .request_timeout
                .map(|timeout| tokio::spawn(expire_after(Arc::downgrade(self), id.clone(), timeout)));
            correlator.register(id.clone(), reply_tx, timer);
        }

        if outbound.send(Outbound::Frame(self.transport.outbound(raw.as_bytes()))).is_err() {
            lock(&self.correlator).remove(&id);
            return Err(ClientError::NotConnected);
        }
        Ok(reply_rx)
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Outbound>, ClientError> {
        if lock(&self.status).state != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        lock(&self.socket)
            .as_ref()
            .map(|socket| socket.outbound.clone())
            .ok_or(ClientError::NotConnected)
    }
}

async fn await_reply(reply: oneshot::Receiver<Reply>, id: String) -> Result<HttpMessage, ClientError> {
    match reply.await {
        Ok(reply) => reply,
        Err(_) => Err(ClientError::ClosedWhilePending { transaction_id: id }),
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for timer in [timers.keepalive.take(), timers.reconnect.take(), timers.success_reset.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

async fn run_socket(
    inner: Weak<Inner>,
    generation: u64,
    stream: Socket,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: watch::Sender<bool>,
) {
    let (mut sink, mut source) = stream.split();
    let mut close_deadline: Option<Instant> = None;

    loop {
        let ack_timeout = async move {
            match close_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = source.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(generation, error = %err, "socket: read failed");
                        break;
                    }
                };
                match msg {
                    Message::Binary(bytes) => {
                        if let Some(inner) = inner.upgrade() {
                            inner.handle_frame(&bytes);
                        }
                    }
                    Message::Text(text) => {
                        if let Some(inner) = inner.upgrade() {
                            inner.handle_frame(text.as_bytes());
                        }
                    }
                    Message::Close(frame) => debug!(generation, ?frame, "socket: close frame received"),
                    _ => {}
                }
            }
            command = outbound.recv(), if close_deadline.is_none() => {
                match command {
                    Some(Outbound::Frame(bytes)) => {
                        if let Err(err) = sink.send(Message::Binary(bytes.into())).await {
                            warn!(generation, error = %err, "socket: write failed");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        if let Some(inner) = inner.upgrade() {
                            inner.set_state(ConnectionState::Closing);
                        }
                        if let Err(err) = sink.send(Message::Close(None)).await {
                            debug!(generation, error = %err, "socket: close frame not sent");
                            break;
                        }
                        close_deadline = Some(Instant::now() + CLOSE_ACK_TIMEOUT);
                    }
                }
            }
            () = ack_timeout => {
                warn!(generation, "socket: close acknowledgment timed out");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_close(generation);
    }
    let _ = closed.send(true);
}

async fn keepalive(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        // The strong reference must not outlive the send.
        let sent = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let id = lock(&inner.correlator).next_transaction_id();
            inner.send_request(Method::Get, PING_URI, "", id.clone()).map(|reply| (reply, id))
        };
        match sent {
            Ok((reply, id)) => {
                tokio::spawn(async move {
                    if let Err(err) = await_reply(reply, id).await {
                        warn!(error = %err, "socket: keepalive ping failed");
                    }
                });
            }
            Err(err) => warn!(error = %err, "socket: keepalive ping failed"),
        }
    }
}

async fn expire_after(inner: Weak<Inner>, id: String, timeout: Duration) {
    sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if lock(&inner.correlator).expire(&id, timeout) {
        warn!(transaction_id = %id, ?timeout, "socket: request timed out, closing socket");
        inner.force_close();
    }
}

fn reconnect_loop(inner: Weak<Inner>) -> BoxFuture<'static, ()> {
    async move {
        loop {
            let delay = {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                backoff::reconnect_delay(inner.attempts.load(Ordering::SeqCst))
            };
            info!(?delay, "socket: reconnecting after delay");
            sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.may_reconnect() {
                return;
            }
            match inner.connect().await {
                Ok(()) => return,
                Err(err) => warn!(
                    hostname = %inner.config.hostname,
                    attempts = inner.attempts.load(Ordering::SeqCst),
                    error = %err,
                    "socket: reconnect failed"
                ),
            }
        }
    }
    .boxed()
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
