//! LDAP session layer: listener, per-connection read loop, writer task and StartTLS.
//!
//! A connection is read by one task. Bind runs inline, every other request is
//! registered under its message id and spawned, so a later Abandon can cancel
//! it. Handlers never touch the socket: they push responses into a bounded
//! queue drained by the connection's writer task.

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use dashmap::mapref::entry::Entry as SlotEntry;
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::acl::User;
use crate::config::ListenConfig;
use crate::ldap_protocol::{
    encode_ldap_message, try_decode_message, Control, ExtendedResponse, LdapMessage, LdapResult,
    ProtocolOp, ResultCode, NOTICE_OF_DISCONNECTION_OID, START_TLS_OID,
};
use crate::metrics::Metrics;

const DEFAULT_OUTPUT_QUEUE: usize = 32;
const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Client stream: either plain TCP or TLS-wrapped, for ldap://, ldaps:// and StartTLS.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// Read half of ClientStream, owned by the session loop.
pub enum ClientReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Tls(tokio::io::ReadHalf<TlsStream<TcpStream>>),
}

/// Write half of ClientStream, owned by the writer task.
pub enum ClientWriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientReadHalf::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientReadHalf::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientWriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl ClientStream {
    pub fn into_split(self) -> (ClientReadHalf, ClientWriteHalf) {
        match self {
            ClientStream::Tcp(s) => {
                let (r, w) = s.into_split();
                (ClientReadHalf::Tcp(r), ClientWriteHalf::Tcp(w))
            }
            ClientStream::Tls(s) => {
                let (r, w) = tokio::io::split(s);
                (ClientReadHalf::Tls(r), ClientWriteHalf::Tls(w))
            }
        }
    }

    /// Puts the halves of one stream back together.
    pub fn reunite(read: ClientReadHalf, write: ClientWriteHalf) -> Result<Self> {
        match (read, write) {
            (ClientReadHalf::Tcp(r), ClientWriteHalf::Tcp(w)) => r
                .reunite(w)
                .map(ClientStream::Tcp)
                .map_err(|_| anyhow!("Stream halves belong to different connections")),
            (ClientReadHalf::Tls(r), ClientWriteHalf::Tls(w)) => Ok(ClientStream::Tls(r.unsplit(w))),
            _ => bail!("Cannot reunite a plain half with a TLS half"),
        }
    }
}

/// The principal a session runs as. Shared by every request of the session and
/// replaced by Bind.
#[derive(Clone)]
pub struct Principal(Arc<ArcSwap<User>>);

impl Default for Principal {
    fn default() -> Self {
        Self(Arc::new(ArcSwap::from_pointee(User::anonymous())))
    }
}

impl Principal {
    pub fn get(&self) -> Arc<User> {
        self.0.load_full()
    }

    pub fn set(&self, user: User) {
        self.0.store(Arc::new(user));
    }
}

/// One decoded request together with its session state.
pub struct Request {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
    principal: Principal,
    cancel: CancellationToken,
}

impl Request {
    pub fn new(
        message_id: i32,
        op: ProtocolOp,
        controls: Vec<Control>,
        principal: Principal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            op,
            controls,
            principal,
            cancel,
        }
    }

    pub fn user(&self) -> Arc<User> {
        self.principal.get()
    }

    pub fn set_user(&self, user: User) {
        self.principal.set(user);
    }

    /// True once the request was abandoned or the session is going away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Queues responses for one request. Responses leave in the order written.
#[derive(Clone)]
pub struct ResponseWriter {
    message_id: i32,
    tx: mpsc::Sender<LdapMessage>,
}

impl ResponseWriter {
    pub fn new(message_id: i32, tx: mpsc::Sender<LdapMessage>) -> Self {
        Self { message_id, tx }
    }

    /// Waits for room in the connection's queue. Fails once the connection is gone.
    pub async fn write(&self, op: ProtocolOp) -> Result<()> {
        let name = op.name();
        self.tx
            .send(LdapMessage::new(self.message_id, op))
            .await
            .map_err(|_| anyhow!("Connection closed, dropping {} response for msgid {}", name, self.message_id))
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Answers one request. Unbind and Abandon never reach a handler through
    /// the session, but other transports may pass them.
    async fn handle(&self, request: Request, writer: ResponseWriter) -> Result<()>;
}

/// Requests of one connection that may still be abandoned, by message id.
#[derive(Default)]
struct InFlight(DashMap<i32, CancellationToken>);

impl InFlight {
    /// None when the id is already in use.
    fn register(&self, message_id: i32) -> Option<CancellationToken> {
        match self.0.entry(message_id) {
            SlotEntry::Occupied(_) => None,
            SlotEntry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    fn unregister(&self, message_id: i32) {
        self.0.remove(&message_id);
    }

    fn cancel(&self, message_id: i32) -> bool {
        match self.0.get(&message_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for entry in self.0.iter() {
            entry.value().cancel();
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub struct ServerOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub output_queue: usize,
    /// Enables StartTLS, and LDAPS when `implicit_tls` is set.
    pub tls: Option<TlsAcceptor>,
    pub implicit_tls: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            output_queue: DEFAULT_OUTPUT_QUEUE,
            tls: None,
            implicit_tls: false,
        }
    }
}

impl ServerOptions {
    pub fn from_config(listen: &ListenConfig, tls: Option<TlsAcceptor>) -> Result<Self> {
        let implicit_tls = listen.url.starts_with("ldaps://");
        if implicit_tls && tls.is_none() {
            bail!("LDAPS (ldaps://) requires a tls section with cert_file and key_file");
        }
        Ok(Self {
            read_timeout: listen.read_timeout(),
            write_timeout: listen.write_timeout(),
            output_queue: listen.output_queue.unwrap_or(DEFAULT_OUTPUT_QUEUE).max(1),
            tls,
            implicit_tls,
        })
    }
}

pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    // ldap://host:port or ldaps://host:port
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;

    let url = url.trim_start_matches('/');

    if url.starts_with(':') {
        // port only, bind to all interfaces
        let port: u16 = url
            .trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

pub struct LdapServer {
    handler: Arc<dyn Handler>,
    metrics: Arc<Metrics>,
    options: Arc<ServerOptions>,
}

impl LdapServer {
    pub fn new(handler: Arc<dyn Handler>, metrics: Arc<Metrics>, options: ServerOptions) -> Self {
        Self {
            handler,
            metrics,
            options: Arc::new(options),
        }
    }

    pub async fn bind(listen_url: &str) -> Result<TcpListener> {
        let addr = parse_listen_url(listen_url)?;
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    /// Accepts connections until `shutdown` fires, then waits for every session
    /// to send its Notice of Disconnection and drain.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!("LDAP server listening on {}", local);

        let sessions = TaskTracker::new();
        let mut next_id = 0u64;
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            next_id += 1;
            let session = Session {
                id: next_id,
                peer,
                options: Arc::clone(&self.options),
                principal: Principal::default(),
                tasks: TaskTracker::new(),
                dispatcher: Dispatcher {
                    conn: next_id,
                    handler: Arc::clone(&self.handler),
                    metrics: Arc::clone(&self.metrics),
                    in_flight: Arc::new(InFlight::default()),
                    teardown: CancellationToken::new(),
                },
            };
            sessions.spawn(session.run(stream, shutdown.clone()));
        }

        drop(listener);
        info!("Listener on {} closed, draining {} sessions", local, sessions.len());
        sessions.close();
        sessions.wait().await;
        info!("All sessions closed");
        Ok(())
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| anyhow!("timed out after {:?}", limit))?
            .map_err(Into::into),
        None => fut.await.map_err(Into::into),
    }
}

fn notice_of_disconnection(result: LdapResult) -> LdapMessage {
    LdapMessage::new(
        0,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
            response_value: None,
        }),
    )
}

/// Drains the queue onto the socket and hands the half back once every sender is gone.
async fn write_loop(
    mut half: ClientWriteHalf,
    mut rx: mpsc::Receiver<LdapMessage>,
    metrics: Arc<Metrics>,
    deadline: Option<Duration>,
    teardown: CancellationToken,
) -> Result<ClientWriteHalf> {
    let written: Result<()> = async {
        while let Some(message) = rx.recv().await {
            if message.message_id != 0 {
                if let Some(result) = message.protocol_op.result() {
                    metrics.record_result(message.protocol_op.name(), result.result_code);
                }
            }
            let data = encode_ldap_message(&message).with_context(|| {
                format!(
                    "Failed to encode {} response for msgid {}",
                    message.protocol_op.name(),
                    message.message_id
                )
            })?;
            with_deadline(deadline, async {
                half.write_all(&data).await?;
                half.flush().await
            })
            .await
            .context("Failed to write response")?;
        }
        Ok(())
    }
    .await;

    match written {
        Ok(()) => Ok(half),
        Err(e) => {
            teardown.cancel();
            Err(e)
        }
    }
}

/// Runs requests for one connection.
#[derive(Clone)]
struct Dispatcher {
    conn: u64,
    handler: Arc<dyn Handler>,
    metrics: Arc<Metrics>,
    in_flight: Arc<InFlight>,
    /// Fired when the connection must be dropped: writer failure or handler panic.
    teardown: CancellationToken,
}

impl Dispatcher {
    async fn run(self, request: Request, out: mpsc::Sender<LdapMessage>) {
        let message_id = request.message_id;
        let op = request.op.name();
        let fallback = request.op.response_with(LdapResult::with_message(
            ResultCode::OperationsError,
            INTERNAL_ERROR_MESSAGE,
        ));
        self.metrics.inc_request(op);
        let started = Instant::now();

        let handler = Arc::clone(&self.handler);
        let writer = ResponseWriter::new(message_id, out.clone());
        // a separate task so a panicking handler is reported instead of unwinding the session
        match tokio::spawn(async move { handler.handle(request, writer).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn = self.conn, msgid = message_id, "{} response not delivered: {:#}", op, e),
            Err(e) => {
                error!(conn = self.conn, msgid = message_id, "{} handler failed: {}", op, e);
                if let Some(response) = fallback {
                    let _ = out.send(LdapMessage::new(message_id, response)).await;
                }
                self.teardown.cancel();
            }
        }

        self.metrics.observe_duration(op, started.elapsed());
        drop(out);
        self.in_flight.unregister(message_id);
    }
}

enum Step {
    Continue,
    Unbind,
    StartTls(i32),
}

/// Why the read loop stopped.
enum End {
    Closed,
    Unbind,
    Malformed,
    Shutdown,
    Teardown,
}

type Writer = JoinHandle<Result<ClientWriteHalf>>;

struct Session {
    id: u64,
    peer: SocketAddr,
    options: Arc<ServerOptions>,
    principal: Principal,
    /// Spawned requests, drained before the socket is closed.
    tasks: TaskTracker,
    dispatcher: Dispatcher,
}

impl Session {
    async fn run(self, stream: TcpStream, shutdown: CancellationToken) {
        let metrics = Arc::clone(&self.dispatcher.metrics);
        metrics.connection_opened();
        info!(conn = self.id, "New connection from {}", self.peer);

        let stream = match (&self.options.tls, self.options.implicit_tls) {
            (Some(acceptor), true) => match acceptor.accept(stream).await {
                Ok(tls) => Some(ClientStream::Tls(tls)),
                Err(e) => {
                    warn!(conn = self.id, "TLS handshake failed for {}: {}", self.peer, e);
                    None
                }
            },
            (None, true) => {
                error!(conn = self.id, "LDAPS listener without TLS configuration");
                None
            }
            (_, false) => Some(ClientStream::Tcp(stream)),
        };

        if let Some(stream) = stream {
            if let Err(e) = self.serve_connection(stream, shutdown).await {
                warn!(conn = self.id, "Connection from {} failed: {:#}", self.peer, e);
            }
        }
        metrics.connection_closed();
        info!(conn = self.id, "Connection from {} closed", self.peer);
    }

    fn start_writer(&self, half: ClientWriteHalf) -> (mpsc::Sender<LdapMessage>, Writer) {
        let (tx, rx) = mpsc::channel(self.options.output_queue);
        let writer = tokio::spawn(write_loop(
            half,
            rx,
            Arc::clone(&self.dispatcher.metrics),
            self.options.write_timeout,
            self.dispatcher.teardown.clone(),
        ));
        (tx, writer)
    }

    async fn serve_connection(&self, stream: ClientStream, shutdown: CancellationToken) -> Result<()> {
        let mut encrypted = matches!(stream, ClientStream::Tls(_));
        let (mut reader, half) = stream.into_split();
        let (mut out, mut writer) = self.start_writer(half);
        let mut buffer = BytesMut::with_capacity(4096);
        let mut chunk = vec![0u8; 4096];

        let end = loop {
            let decoded = match try_decode_message(&buffer) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.dispatcher.metrics.inc_parse_error();
                    warn!(conn = self.id, "Malformed LDAP message from {}: {:#}", self.peer, e);
                    break End::Malformed;
                }
            };
            let Some((message, used)) = decoded else {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => break End::Shutdown,
                    _ = self.dispatcher.teardown.cancelled() => break End::Teardown,
                    read = with_deadline(self.options.read_timeout, reader.read(&mut chunk)) => read,
                };
                match read {
                    Ok(0) => break End::Closed,
                    Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(conn = self.id, "Read from {} failed: {:#}", self.peer, e);
                        break End::Closed;
                    }
                }
                continue;
            };
            buffer.advance(used);

            match self.process(message, &out).await {
                Step::Continue => {}
                Step::Unbind => break End::Unbind,
                Step::StartTls(message_id) => {
                    let refusal = self.start_tls_refusal(encrypted);
                    let accepted = refusal.is_none();
                    let response = ExtendedResponse {
                        result: refusal.unwrap_or_else(LdapResult::success),
                        response_name: Some(START_TLS_OID.to_string()),
                        response_value: None,
                    };
                    ResponseWriter::new(message_id, out.clone())
                        .write(ProtocolOp::ExtendedResponse(response))
                        .await?;
                    if !accepted {
                        continue;
                    }
                    if !buffer.is_empty() {
                        warn!(conn = self.id, "Discarding {} bytes sent before the TLS handshake", buffer.len());
                        buffer.clear();
                    }

                    // the success response must be on the wire before the handshake starts
                    drop(out);
                    let half = writer.await.context("Writer task failed")??;
                    let acceptor = self.options.tls.clone().context("StartTLS without TLS configuration")?;
                    let ClientStream::Tcp(tcp) = ClientStream::reunite(reader, half)? else {
                        bail!("StartTLS on an encrypted connection");
                    };
                    let tls = acceptor.accept(tcp).await.context("StartTLS handshake failed")?;
                    info!(conn = self.id, "StartTLS upgrade completed for {}", self.peer);
                    encrypted = true;

                    let (read_half, write_half) = ClientStream::Tls(tls).into_split();
                    reader = read_half;
                    (out, writer) = self.start_writer(write_half);
                }
            }
        };

        self.close(end, out, writer).await
    }

    async fn process(&self, message: LdapMessage, out: &mpsc::Sender<LdapMessage>) -> Step {
        let LdapMessage {
            message_id,
            protocol_op,
            controls,
        } = message;
        debug!(conn = self.id, msgid = message_id, "Received {} message", protocol_op.name());

        match protocol_op {
            ProtocolOp::UnbindRequest => Step::Unbind,
            ProtocolOp::AbandonRequest(target) => {
                if self.dispatcher.in_flight.cancel(target) {
                    debug!(conn = self.id, "Abandoning msgid {}", target);
                } else {
                    debug!(conn = self.id, "Nothing to abandon for msgid {}", target);
                }
                Step::Continue
            }
            ProtocolOp::ExtendedRequest(ref req) if req.request_name == START_TLS_OID => {
                Step::StartTls(message_id)
            }
            op => {
                let Some(cancel) = self.dispatcher.in_flight.register(message_id) else {
                    warn!(conn = self.id, msgid = message_id, "Message id already in use");
                    let result = LdapResult::with_message(ResultCode::ProtocolError, "message id already in use");
                    if let Some(response) = op.response_with(result) {
                        let _ = out.send(LdapMessage::new(message_id, response)).await;
                    }
                    return Step::Continue;
                };
                let inline = matches!(op, ProtocolOp::BindRequest(_));
                let request = Request::new(message_id, op, controls, self.principal.clone(), cancel);
                let job = self.dispatcher.clone().run(request, out.clone());
                if inline {
                    job.await;
                } else {
                    self.tasks.spawn(job);
                }
                Step::Continue
            }
        }
    }

    fn start_tls_refusal(&self, encrypted: bool) -> Option<LdapResult> {
        if encrypted {
            return Some(LdapResult::with_message(
                ResultCode::ProtocolError,
                "StartTLS not permitted on secure connection",
            ));
        }
        if self.options.tls.is_none() {
            return Some(LdapResult::with_message(
                ResultCode::UnwillingToPerform,
                "StartTLS not configured",
            ));
        }
        if !self.dispatcher.in_flight.is_empty() {
            return Some(LdapResult::with_message(
                ResultCode::OperationsError,
                "StartTLS with outstanding operations",
            ));
        }
        None
    }

    async fn close(&self, end: End, out: mpsc::Sender<LdapMessage>, writer: Writer) -> Result<()> {
        let notice = match end {
            End::Shutdown => Some(LdapResult::with_message(
                ResultCode::UnwillingToPerform,
                "server is about to stop",
            )),
            End::Malformed => Some(LdapResult::with_message(
                ResultCode::ProtocolError,
                "malformed LDAP message",
            )),
            End::Closed | End::Unbind | End::Teardown => None,
        };
        if let Some(result) = notice {
            let _ = out.send(notice_of_disconnection(result)).await;
        }

        self.dispatcher.in_flight.cancel_all();
        self.tasks.close();
        self.tasks.wait().await;

        drop(out);
        let mut half = writer.await.context("Writer task failed")??;
        let _ = half.shutdown().await;
        Ok(())
    }
}
