//! Connection management for AMI

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::{
    action::{AmiAction, AmiResponse},
    config::{AmiTarget, ClientOptions, TlsMode},
    constants::{AMI_BANNER, SOCKET_BUF_SIZE},
    error::{AmiError, AmiResult},
    event::AmiEvent,
    protocol::{AmiFrame, AmiParser, HeaderList},
    tls,
};

/// Connection status for AMI client
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// TCP/TLS connect and banner check in progress.
    Connecting,
    /// `Login` sent, waiting for its response.
    Authenticating,
    /// Logged in; actions may be submitted.
    Connected,
    /// No usable transport.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// `connect()` was never called
    NeverConnected,
    /// Connect, banner check or login failed
    HandshakeFailed(String),
    /// Transport I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Framing was lost
    ProtocolError(String),
    /// Clean EOF from the server
    ConnectionClosed,
    /// A keepalive `Ping` could not be sent
    KeepaliveFailed,
    /// Client called close()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::NeverConnected => write!(f, "never connected"),
            DisconnectReason::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::KeepaliveFailed => write!(f, "keepalive failed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Callback invoked on the read loop for each matching event.
///
/// Handlers run synchronously and must not block; any closure
/// `Fn(&AmiEvent) + Send + Sync` qualifies.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &AmiEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&AmiEvent) + Send + Sync,
{
    fn handle(&self, event: &AmiEvent) {
        self(event)
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedStream = Box<dyn AsyncStream>;

struct ReaderState {
    generation: u64,
    half: ReadHalf<BoxedStream>,
    parser: AmiParser,
}

struct WriterState {
    generation: u64,
    half: WriteHalf<BoxedStream>,
}

type EventItem = Result<AmiEvent, AmiError>;

/// Shared state between AmiClient handles, the read loop and the keepalive task
struct Inner {
    target: AmiTarget,
    options: ClientOptions,
    /// Bumped by every connect; stale read loops leave newer transports alone
    generation: AtomicU64,
    reader: tokio::sync::Mutex<Option<ReaderState>>,
    writer: tokio::sync::Mutex<Option<WriterState>>,
    pending: Mutex<HashMap<String, oneshot::Sender<AmiResponse>>>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    default_handler: RwLock<Option<Arc<dyn EventHandler>>>,
    subscriber: Mutex<Option<mpsc::Sender<EventItem>>>,
    error_tx: Mutex<Option<mpsc::Sender<AmiError>>>,
    /// Set when events have been dropped due to a full queue
    event_overflow: AtomicBool,
    /// Total count of dropped events
    dropped_event_count: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Handler table key; event names match case-insensitively.
fn handler_key(event: &str) -> String {
    event.to_ascii_lowercase()
}

const DEFAULT_HANDLER_NAME: &str = "<default>";

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit: Duration) -> AmiResult<TcpStream> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                limit.as_millis()
            );
            Err(AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Read until the greeting line is buffered.
async fn read_banner(
    stream: &mut BoxedStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> AmiResult<String> {
    loop {
        if let Some(line) = parser.take_banner() {
            return Ok(line);
        }
        let n = stream
            .read(read_buffer)
            .await?;
        if n == 0 {
            return Err(AmiError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// Read frames until a response arrives. Used for the login reply, before the
/// read loop owns the transport.
async fn read_response(
    stream: &mut BoxedStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> AmiResult<AmiResponse> {
    loop {
        match parser.parse_frame()? {
            Some(AmiFrame::Response(response)) => return Ok(response),
            Some(other) => {
                debug!("[AUTH] Skipping frame before login reply: {:?}", other);
                continue;
            }
            None => {}
        }

        let n = stream
            .read(read_buffer)
            .await?;
        trace!("[RECV] Read {} bytes from socket", n);
        if n == 0 {
            return Err(AmiError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// Try to send an event (or error) to the subscriber via try_send.
///
/// If the channel is full, drop the item, set the overflow flag, and
/// increment the dropped counter. Before each dispatch, check the overflow
/// flag and attempt to deliver a QueueFull error notification first.
/// Returns `false` once the receiver is gone.
fn offer_event(event_tx: &mpsc::Sender<EventItem>, inner: &Inner, item: EventItem) -> bool {
    if inner
        .event_overflow
        .load(Ordering::Relaxed)
    {
        match event_tx.try_send(Err(AmiError::QueueFull)) {
            Ok(()) => {
                inner
                    .event_overflow
                    .store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match event_tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            inner
                .event_overflow
                .store(true, Ordering::Relaxed);
            inner
                .dropped_event_count
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping event");
            true
        }
    }
}

/// Awaitable reply to one submitted action.
///
/// Resolves to `Err(ConnectionClosed)` if the delivery point is discarded
/// before a response arrives (the next connect drops stale entries).
#[derive(Debug)]
pub struct PendingResponse {
    action_id: String,
    rx: oneshot::Receiver<AmiResponse>,
}

impl PendingResponse {
    /// ActionID the response will carry.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }
}

impl Future for PendingResponse {
    type Output = AmiResult<AmiResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| AmiError::ConnectionClosed))
    }
}

/// AMI client handle (Clone + Send)
///
/// One handle drives one connection at a time: [`connect`](Self::connect),
/// then [`run`](Self::run) until it returns, then connect again. Actions
/// are serialized through the writer mutex; the read loop routes each
/// response to the submitter holding its ActionID.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), ami_statsd::AmiError> {
/// use ami_statsd::{AmiAction, AmiClient, ClientOptions};
///
/// let client = AmiClient::new("admin:secret@127.0.0.1:5038".parse()?, ClientOptions::default());
/// client.register_handler("Hangup", |event: &ami_statsd::AmiEvent| {
///     println!("hangup {:?}", event.unique_id());
/// })?;
/// client.connect([("Events", "call,command")]).await?;
///
/// let runner = client.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// let pong = client.submit(AmiAction::ping()).await?;
/// println!("{}", pong.status());
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("target", &self.inner.target)
            .field("status", &self.status())
            .field("pending", &self.pending_actions_count())
            .finish()
    }
}

/// Event subscription receiver (!Clone)
///
/// Events are delivered as `Result<AmiEvent, AmiError>`. An `Err(AmiError::QueueFull)`
/// indicates that one or more events were dropped because the application fell behind.
/// Use [`AmiClient::dropped_event_count`] for the exact count.
pub struct AmiEventStream {
    rx: mpsc::Receiver<EventItem>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("status", &self.status())
            .finish()
    }
}

impl AmiClient {
    /// Create a disconnected client.
    pub fn new(target: AmiTarget, options: ClientOptions) -> Self {
        let (status_tx, _) =
            watch::channel(ConnectionStatus::Disconnected(DisconnectReason::NeverConnected));

        Self {
            inner: Arc::new(Inner {
                target,
                options,
                generation: AtomicU64::new(0),
                reader: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                default_handler: RwLock::new(None),
                subscriber: Mutex::new(None),
                error_tx: Mutex::new(None),
                event_overflow: AtomicBool::new(false),
                dropped_event_count: AtomicU64::new(0),
                status_tx,
                keepalive: Mutex::new(None),
            }),
        }
    }

    pub fn target(&self) -> &AmiTarget {
        &self.inner.target
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Open the transport, check the banner and log in.
    ///
    /// `extra_params` are added to the `Login` action (typically
    /// `Events: call,command`). Delivery points left over from a previous
    /// connection are discarded first, resolving their waiters with
    /// `ConnectionClosed`.
    pub async fn connect<I, K, V>(&self, extra_params: I) -> AmiResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let inner = &self.inner;
        let generation = inner
            .generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        inner
            .status_tx
            .send_replace(ConnectionStatus::Connecting);

        let discarded = self.discard_pending();
        if discarded > 0 {
            debug!("[CONNECT] Discarded {} unanswered actions", discarded);
        }
        if let Some(mut old) = inner
            .writer
            .lock()
            .await
            .take()
        {
            let _ = old
                .half
                .shutdown()
                .await;
        }
        inner
            .reader
            .lock()
            .await
            .take();

        let login = AmiAction::login(&inner.target.username, &inner.target.secret)
            .with_params(extra_params);

        info!("Connecting to Asterisk at {}", inner.target.address());
        match self
            .establish(login)
            .await
        {
            Ok((stream, parser)) => {
                let (read_half, write_half) = tokio::io::split(stream);
                *inner
                    .reader
                    .lock()
                    .await = Some(ReaderState {
                    generation,
                    half: read_half,
                    parser,
                });
                *inner
                    .writer
                    .lock()
                    .await = Some(WriterState {
                    generation,
                    half: write_half,
                });
                inner
                    .status_tx
                    .send_replace(ConnectionStatus::Connected);
                info!("Successfully connected and logged in to {}", inner.target.address());
                Ok(())
            }
            Err(e) => {
                inner
                    .status_tx
                    .send_replace(ConnectionStatus::Disconnected(
                        DisconnectReason::HandshakeFailed(e.to_string()),
                    ));
                Err(e)
            }
        }
    }

    async fn establish(&self, login: AmiAction) -> AmiResult<(BoxedStream, AmiParser)> {
        let limit = self
            .inner
            .options
            .connect_timeout;
        let tcp = tcp_connect_with_timeout(&self.inner.target.host, self.inner.target.port, limit)
            .await?;

        match timeout(limit, self.handshake(tcp, login)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("[CONNECT] Handshake timed out after {}ms", limit.as_millis());
                Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        mut login: AmiAction,
    ) -> AmiResult<(BoxedStream, AmiParser)> {
        let target = &self.inner.target;
        let mut stream: BoxedStream = match self.inner.options.tls {
            TlsMode::Disabled => Box::new(tcp),
            TlsMode::Enabled { verify } => {
                let connector = tls::connector(verify)?;
                let server_name = tls::server_name(&target.host)?;
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| AmiError::Tls {
                        message: e.to_string(),
                    })?;
                debug!("[CONNECT] TLS handshake complete (verify={})", verify);
                Box::new(tls_stream)
            }
        };

        let mut parser = AmiParser::new();
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

        let banner = read_banner(&mut stream, &mut parser, &mut read_buffer).await?;
        if !banner.contains(AMI_BANNER) {
            return Err(AmiError::NotAmi { banner });
        }
        debug!("[CONNECT] Server banner: {}", banner);

        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Authenticating);
        login.ensure_action_id(&self.inner.options.action_id_prefix);
        let wire = login.to_wire_format()?;
        debug!("[AUTH] Sending Login for user {}", target.username);
        stream
            .write_all(wire.as_bytes())
            .await?;
        stream
            .flush()
            .await?;

        let response = read_response(&mut stream, &mut parser, &mut read_buffer).await?;
        if response.is_error() {
            return Err(AmiError::auth_failed(
                response
                    .message()
                    .unwrap_or("Authentication failed"),
            ));
        }

        debug!("[AUTH] Login accepted");
        Ok((stream, parser))
    }

    /// Send an action without waiting for its response.
    ///
    /// An `ActionID` is generated when the action has none.
    pub async fn submit_async(&self, mut action: AmiAction) -> AmiResult<PendingResponse> {
        let action_id = action.ensure_action_id(&self.inner.options.action_id_prefix);
        let wire = action.to_wire_format()?;

        let mut writer = self
            .inner
            .writer
            .lock()
            .await;
        let Some(state) = writer.as_mut() else {
            return Err(AmiError::NotConnected);
        };

        let rx = self.register_pending(&action_id)?;
        trace!("[SEND] {:?}", action);

        let written = async {
            state
                .half
                .write_all(wire.as_bytes())
                .await?;
            state
                .half
                .flush()
                .await
        }
        .await;

        if let Err(e) = written {
            warn!("[SEND] Failed to write {}: {}", action.name(), e);
            self.remove_pending(&action_id);
            return Err(AmiError::Io(e));
        }

        debug!("[SEND] {} ({})", action.name(), action_id);
        Ok(PendingResponse { action_id, rx })
    }

    /// Send an action and wait for its response.
    ///
    /// Waits indefinitely unless [`ClientOptions::action_timeout`] is set.
    /// `Response: Error` is returned as `Ok`; use
    /// [`AmiResponse::into_result`] to turn it into an error.
    pub async fn submit(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        let pending = self
            .submit_async(action)
            .await?;

        let Some(limit) = self
            .inner
            .options
            .action_timeout
        else {
            return pending.await;
        };

        let action_id = pending
            .action_id()
            .to_string();
        match timeout(limit, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.remove_pending(&action_id);
                Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Read and dispatch frames until the connection ends.
    ///
    /// Always returns an error: the transport closed, a read failed, framing
    /// was lost, or [`close`](Self::close) was called
    /// (`ConnectionClosed`). Handlers run on this task.
    pub async fn run(&self) -> AmiResult<()> {
        let ReaderState {
            generation,
            half: mut reader,
            mut parser,
        } = self
            .inner
            .reader
            .lock()
            .await
            .take()
            .ok_or(AmiError::NotConnected)?;

        let mut status_rx = self
            .inner
            .status_tx
            .subscribe();
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
        debug!("[RUN] Read loop started");

        let result: AmiResult<()> = loop {
            if !matches!(*status_rx.borrow_and_update(), ConnectionStatus::Connected) {
                break Err(AmiError::ConnectionClosed);
            }

            // Drain complete frames before touching the socket
            match parser.parse_frame() {
                Ok(Some(frame)) => {
                    self.dispatch_frame(frame);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Parser error: {}", e);
                    break Err(e);
                }
            }

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break Err(AmiError::ConnectionClosed);
                    }
                }
                read = reader.read(&mut read_buffer) => match read {
                    Ok(0) => {
                        info!("Connection closed (EOF)");
                        break Err(AmiError::ConnectionClosed);
                    }
                    Ok(n) => {
                        trace!("[RECV] Read {} bytes from socket", n);
                        if let Err(e) = parser.add_data(&read_buffer[..n]) {
                            warn!("Buffer error: {}", e);
                            break Err(e);
                        }
                    }
                    Err(e) => {
                        warn!("Read error: {}", e);
                        break Err(AmiError::Io(e));
                    }
                },
            }
        };

        self.finish_run(generation, &result)
            .await;
        result
    }

    /// Tear down after the read loop, unless a newer connect took over.
    async fn finish_run(&self, generation: u64, result: &AmiResult<()>) {
        if self
            .inner
            .generation
            .load(Ordering::SeqCst)
            != generation
        {
            return;
        }

        let reason = match result {
            Err(AmiError::Io(e)) => DisconnectReason::IoError(e.to_string()),
            Err(e @ (AmiError::ProtocolError { .. } | AmiError::InvalidHeader { .. })) => {
                DisconnectReason::ProtocolError(e.to_string())
            }
            _ => DisconnectReason::ConnectionClosed,
        };
        self.inner
            .status_tx
            .send_if_modified(|status| {
                if matches!(status, ConnectionStatus::Disconnected(_)) {
                    return false;
                }
                *status = ConnectionStatus::Disconnected(reason);
                true
            });

        let mut writer = self
            .inner
            .writer
            .lock()
            .await;
        if writer
            .as_ref()
            .is_some_and(|w| w.generation == generation)
        {
            writer.take();
        }
        debug!("[RUN] Read loop stopped");
    }

    pub(crate) fn dispatch_frame(&self, frame: AmiFrame) {
        match frame {
            AmiFrame::Response(response) => self.deliver_response(response),
            AmiFrame::Event(event) => self.dispatch_event(event),
            AmiFrame::Unrecognized(headers) => self.report_unrecognized(headers),
        }
    }

    fn deliver_response(&self, response: AmiResponse) {
        let sender = lock(&self.inner.pending).remove(response.action_id());
        match sender {
            Some(tx) => {
                trace!("[RECV] Response for {}", response.action_id());
                // A receiver dropped by submit_async callers is fine
                let _ = tx.send(response);
            }
            None => debug!(
                "Response for unknown ActionID {:?} ({}), dropping",
                response.action_id(),
                response.status()
            ),
        }
    }

    fn dispatch_event(&self, event: AmiEvent) {
        trace!("[RECV] Event {}", event);

        let subscriber = lock(&self.inner.subscriber).clone();
        if let Some(tx) = subscriber {
            if !offer_event(&tx, &self.inner, Ok(event.clone())) {
                debug!("Event subscriber gone, unsubscribing");
                let mut slot = lock(&self.inner.subscriber);
                if slot
                    .as_ref()
                    .is_some_and(|current| current.same_channel(&tx))
                {
                    slot.take();
                }
            }
        }

        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handler_key(event.name()))
            .cloned()
            .or_else(|| {
                self.inner
                    .default_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });

        if let Some(handler) = handler {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event))).is_err() {
                error!("handler for {} panicked", event.name());
            }
        }
    }

    fn report_unrecognized(&self, headers: HeaderList) {
        let names: Vec<String> = headers
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let err = AmiError::UnrecognizedFrame { headers: names };

        let error_tx = lock(&self.inner.error_tx).clone();
        match error_tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(err) {
                    warn!("Error channel unavailable, dropping: {}", e);
                }
            }
            None => warn!("{}", err),
        }
    }

    fn register_pending(&self, action_id: &str) -> AmiResult<oneshot::Receiver<AmiResponse>> {
        let mut pending = lock(&self.inner.pending);
        if pending.contains_key(action_id) {
            return Err(AmiError::DuplicateActionId {
                action_id: action_id.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(action_id.to_string(), tx);
        Ok(rx)
    }

    fn remove_pending(&self, action_id: &str) {
        lock(&self.inner.pending).remove(action_id);
    }

    fn discard_pending(&self) -> usize {
        let mut pending = lock(&self.inner.pending);
        let n = pending.len();
        pending.clear();
        n
    }

    /// Send `Ping` every `interval` until stopped. A failed send closes the
    /// transport, which ends [`run`](Self::run). Replaces any running keepalive.
    pub fn keep_alive(&self, interval: Duration) -> AmiResult<()> {
        if interval.is_zero() {
            return Err(AmiError::config("keepalive interval must be non-zero"));
        }
        self.stop_keep_alive();

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker
                    .tick()
                    .await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let client = AmiClient { inner };
                match client
                    .submit_async(AmiAction::ping())
                    .await
                {
                    Ok(pending) => trace!("[KEEPALIVE] Ping sent ({})", pending.action_id()),
                    Err(e) => {
                        warn!("[KEEPALIVE] Ping failed: {}, closing transport", e);
                        client
                            .close_transport(DisconnectReason::KeepaliveFailed)
                            .await;
                        return;
                    }
                }
            }
        });

        *lock(&self.inner.keepalive) = Some(handle);
        debug!("[KEEPALIVE] Started with interval {}ms", interval.as_millis());
        Ok(())
    }

    /// Stop the keepalive task, if any.
    pub fn stop_keep_alive(&self) {
        if let Some(handle) = lock(&self.inner.keepalive).take() {
            handle.abort();
            debug!("[KEEPALIVE] Stopped");
        }
    }

    /// Send `Logoff` without waiting for the reply, then shut the transport
    /// down and wake the read loop.
    pub async fn close(&self) {
        info!("Client requested close");
        let limit = self
            .inner
            .options
            .connect_timeout;
        match timeout(limit, self.submit_async(AmiAction::logoff())).await {
            Ok(Ok(pending)) => debug!("[CLOSE] Logoff sent ({})", pending.action_id()),
            Ok(Err(e)) => debug!("[CLOSE] Logoff not sent: {}", e),
            Err(_) => warn!("[CLOSE] Logoff timed out"),
        }
        self.close_transport(DisconnectReason::ClientRequested)
            .await;
    }

    async fn close_transport(&self, reason: DisconnectReason) {
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected(reason));

        let limit = self
            .inner
            .options
            .connect_timeout;
        let writer = match timeout(limit, self.inner.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("[CLOSE] Writer busy, dropping transport without shutdown");
                None
            }
        };
        if let Some(mut state) = writer {
            if let Err(e) = state
                .half
                .shutdown()
                .await
            {
                debug!("[CLOSE] Shutdown failed: {}", e);
            }
        }
    }

    /// Install the handler for `event`. Names match case-insensitively.
    pub fn register_handler<H>(&self, event: &str, handler: H) -> AmiResult<()>
    where
        H: EventHandler + 'static,
    {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let key = handler_key(event);
        if handlers.contains_key(&key) {
            return Err(AmiError::AlreadyRegistered {
                event: event.to_string(),
            });
        }
        handlers.insert(key, Arc::new(handler));
        Ok(())
    }

    pub fn unregister_handler(&self, event: &str) -> AmiResult<()> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handler_key(event))
            .map(|_| ())
            .ok_or_else(|| AmiError::NotRegistered {
                event: event.to_string(),
            })
    }

    /// Install the handler for events without a named handler.
    pub fn register_default_handler<H>(&self, handler: H) -> AmiResult<()>
    where
        H: EventHandler + 'static,
    {
        let mut slot = self
            .inner
            .default_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(AmiError::AlreadyRegistered {
                event: DEFAULT_HANDLER_NAME.to_string(),
            });
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    pub fn unregister_default_handler(&self) -> AmiResult<()> {
        self.inner
            .default_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|_| ())
            .ok_or_else(|| AmiError::NotRegistered {
                event: DEFAULT_HANDLER_NAME.to_string(),
            })
    }

    /// Receive every event on a bounded channel, replacing any previous
    /// subscription. A full channel drops events rather than stalling the
    /// read loop.
    pub fn subscribe(&self, queue_size: usize) -> AmiEventStream {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        *lock(&self.inner.subscriber) = Some(tx);
        self.inner
            .event_overflow
            .store(false, Ordering::Relaxed);
        AmiEventStream {
            rx,
            status_rx: self
                .inner
                .status_tx
                .subscribe(),
        }
    }

    /// [`subscribe`](Self::subscribe) with [`ClientOptions::event_queue_size`].
    pub fn events(&self) -> AmiEventStream {
        self.subscribe(
            self.inner
                .options
                .event_queue_size,
        )
    }

    /// Route unrecognized frames to `tx` instead of the log.
    pub fn set_error_channel(&self, tx: mpsc::Sender<AmiError>) {
        *lock(&self.inner.error_tx) = Some(tx);
    }

    /// Number of actions awaiting a response.
    pub fn pending_actions_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// ActionIDs awaiting a response, sorted.
    pub fn pending_action_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.pending)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of events dropped due to a full subscription queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.inner
            .dropped_event_count
            .load(Ordering::Relaxed)
    }

    /// Whether the client is logged in.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .inner
                .status_tx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner
            .status_tx
            .borrow()
            .clone()
    }

    /// Watch connection status changes.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner
            .status_tx
            .subscribe()
    }
}

impl AmiEventStream {
    /// Receive the next event, or None once the subscription is replaced or
    /// the client is dropped.
    pub async fn recv(&mut self) -> Option<EventItem> {
        self.rx
            .recv()
            .await
    }

    /// Whether the client is logged in.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = EventItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
