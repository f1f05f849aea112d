use crate::cache::DestinationCache;
use crate::events::{Event, EventSink};
use crate::http::{self, BodyFraming, BodyStream, HeadError, HttpHead};
use crate::metadata::{LinkInfo, Metadata};
use crate::mitm::{HostnameFilter, TlsInterceptor};
use crate::peek::PeekReader;
use crate::rewrite::{RewriteDecision, Rewriter, Verdict};
use crate::sniff;
use crate::socks5;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, info, warn};
use uaproxy_config::{Config, Direction, RewriteMode};

const RELAY_BUFFER_SIZE: usize = 8192;
/// Requests waiting for their response on one connection.
const MAX_PENDING_REQUESTS: usize = 64;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

type ClientReader = PeekReader<ReadHalf<BoxedStream>>;
type ServerReader = PeekReader<ReadHalf<BoxedStream>>;
type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Http = 1,
    /// HTTP recovered from an intercepted TLS session
    Https = 2,
    Tls = 3,
    WebSocket = 4,
}

impl Protocol {
    /// Returns a string representation of the protocol for metrics and logging
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tls => "tls",
            Protocol::WebSocket => "websocket",
        }
    }

    #[inline]
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Protocol::Http,
            2 => Protocol::Https,
            3 => Protocol::Tls,
            4 => Protocol::WebSocket,
            _ => Protocol::Tcp,
        }
    }
}

/// A client stream paired with its already-dialled upstream.
pub struct ConnLink {
    pub local: BoxedStream,
    pub remote: BoxedStream,
    pub info: LinkInfo,
}

impl ConnLink {
    pub fn new(
        local: BoxedStream,
        remote: BoxedStream,
        laddr: impl Into<String>,
        raddr: impl Into<String>,
    ) -> Self {
        Self {
            local,
            remote,
            info: LinkInfo::new(laddr, raddr),
        }
    }

    pub fn with_remote_ip(mut self, ip: IpAddr) -> Self {
        self.info.remote_ip = Some(ip);
        self
    }
}

/// One-shot broadcast of the client-side classification.
struct SniffGate {
    tx: watch::Sender<Option<Protocol>>,
}

impl SniffGate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Only the first call has any effect.
    fn fire(&self, protocol: Protocol) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(protocol);
            true
        })
    }

    async fn wait(&self) -> Protocol {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.unwrap_or(Protocol::Tcp),
            Err(_) => Protocol::Tcp,
        }
    }
}

/// Resolves the gate as plain TCP if the client side bails out before
/// classifying.
struct GateGuard<'a>(&'a SniffGate);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.fire(Protocol::Tcp);
    }
}

/// State shared by the two forwarding tasks of one connection.
struct LinkState {
    info: Arc<LinkInfo>,
    intercepted: bool,
    protocol: AtomicU8,
    skipped: AtomicBool,
    gate: SniffGate,
    pending: Mutex<VecDeque<HttpHead>>,
}

impl LinkState {
    fn new(info: Arc<LinkInfo>, intercepted: bool) -> Self {
        Self {
            info,
            intercepted,
            protocol: AtomicU8::new(Protocol::Tcp as u8),
            skipped: AtomicBool::new(false),
            gate: SniffGate::new(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    fn set_protocol(&self, protocol: Protocol) {
        self.protocol.store(protocol as u8, Ordering::Release);
    }

    fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::Acquire)
    }

    fn skip(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    fn push_request(&self, head: HttpHead) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.len() >= MAX_PENDING_REQUESTS {
            pending.pop_front();
        }
        pending.push_back(head);
    }

    /// Request answered by a response with `status`. Interim responses
    /// leave the request queued for the final one.
    fn pair_response(&self, status: u16) -> Option<HttpHead> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if (100..200).contains(&status) && status != 101 {
            pending.front().cloned()
        } else {
            pending.pop_front()
        }
    }
}

struct ConnectionMetrics {
    active: IntGauge,
    relayed_bytes: IntCounterVec,
    sniff_fallbacks: IntCounterVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active = IntGauge::new(
            "uaproxy_connections_active",
            "Number of currently open connections",
        )?;
        registry.register(Box::new(active.clone()))?;

        let relayed_bytes = IntCounterVec::new(
            Opts::new(
                "uaproxy_relayed_bytes_total",
                "Bytes relayed without parsing, per direction",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(relayed_bytes.clone()))?;

        let sniff_fallbacks = IntCounterVec::new(
            Opts::new(
                "uaproxy_sniff_fallbacks_total",
                "Switches to raw forwarding, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(sniff_fallbacks.clone()))?;

        Ok(Self {
            active,
            relayed_bytes,
            sniff_fallbacks,
        })
    }
}

#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
    rewriter: Arc<Rewriter>,
    cache: Arc<DestinationCache>,
    events: EventSink,
    metrics: Option<Arc<ConnectionMetrics>>,
    mitm_filter: Arc<HostnameFilter>,
    interceptor: Option<Arc<dyn TlsInterceptor>>,
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<Config>,
        rewriter: Arc<Rewriter>,
        cache: Arc<DestinationCache>,
        events: EventSink,
        registry: Option<&Registry>,
    ) -> Result<Self, prometheus::Error> {
        let metrics = registry
            .map(ConnectionMetrics::new)
            .transpose()?
            .map(Arc::new);
        let mitm_filter = Arc::new(HostnameFilter::parse(&config.mitm.hostnames));

        Ok(Self {
            config,
            rewriter,
            cache,
            events,
            metrics,
            mitm_filter,
            interceptor: None,
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn TlsInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Serves one SOCKS5 client from handshake to close.
    pub async fn handle_connection(&self, mut client: TcpStream, client_addr: SocketAddr) {
        let peer = client_addr.to_string();
        info!(peer, "New connection");

        let handshake_timeout = Duration::from_secs(self.config.timeouts.sniff);
        let request = match timeout(handshake_timeout, socks5::handshake(&mut client)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                debug!(peer, error = %e, "SOCKS5 handshake failed");
                return;
            }
            Err(_) => {
                debug!(peer, "SOCKS5 handshake timed out");
                return;
            }
        };

        let dest = request.addr();
        let server = match self.connect_to_server(&dest).await {
            Ok(server) => server,
            Err(e) => {
                debug!(peer, dest, error = %e, "Failed to reach destination");
                let _ = socks5::send_reply(&mut client, socks5::reply_for_error(&e)).await;
                return;
            }
        };

        if let Err(e) = socks5::send_reply(&mut client, socks5::REPLY_SUCCEEDED).await {
            debug!(peer, error = %e, "Client went away before CONNECT reply");
            return;
        }

        let remote_ip = server.peer_addr().ok().map(|addr| addr.ip());
        let mut link = ConnLink::new(Box::new(client), Box::new(server), peer, dest);
        if let Some(ip) = remote_ip {
            link = link.with_remote_ip(ip);
        }
        self.serve_conn_link(link).await;
    }

    /// Helper method to connect to a server with timeout
    async fn connect_to_server(&self, target_addr: &str) -> io::Result<TcpStream> {
        debug!("Resolving target address: {}", target_addr);
        let addr = lookup_host(target_addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to resolve target"))?;

        let connect_timeout = Duration::from_secs(self.config.timeouts.connect);
        debug!("Connecting to target: {}", addr);
        let server = timeout(connect_timeout, TcpStream::connect(addr)).await??;
        Ok(server)
    }

    /// Forwards an established link until both directions are closed.
    pub async fn serve_conn_link(&self, link: ConnLink) {
        let ConnLink {
            local,
            remote,
            info,
        } = link;
        let info = Arc::new(info);
        let started = Instant::now();

        if let Some(ref metrics) = self.metrics {
            metrics.active.inc();
        }
        let protocol = self.forward(local, remote, info.clone()).await;
        let duration = started.elapsed();
        if let Some(ref metrics) = self.metrics {
            metrics.active.dec();
        }

        self.events.emit(Event::ConnectionClosed {
            src: info.laddr.clone(),
            dest: info.raddr.clone(),
            protocol,
            duration,
        });
        info!(
            src = %info.laddr,
            dest = %info.raddr,
            protocol = protocol.as_str(),
            duration_secs = %duration.as_secs_f64(),
            "Connection completed"
        );
    }

    async fn forward(&self, local: BoxedStream, remote: BoxedStream, info: Arc<LinkInfo>) -> Protocol {
        let idle = Duration::from_secs(self.config.timeouts.idle);

        if self.rewriter.mode() == RewriteMode::Direct {
            self.relay_raw(local, remote, idle, &info).await;
            return Protocol::Tcp;
        }
        if self.cache.contains(&info.raddr) {
            debug!(dest = %info.raddr, "Destination cached, skipping inspection");
            self.fallback("cached");
            self.relay_raw(local, remote, idle, &info).await;
            return Protocol::Tcp;
        }

        let (local, remote, intercepted) =
            match self.try_intercept(PeekReader::new(local), remote, &info).await {
                Ok(streams) => streams,
                Err(e) => {
                    warn!(src = %info.laddr, dest = %info.raddr, error = %e, "TLS interception failed");
                    return Protocol::Tls;
                }
            };

        let (local, pending) = local.into_parts();
        let (local_read, local_write) = io::split(local);
        let (remote_read, remote_write) = io::split(remote);
        let client_reader = PeekReader::from_parts(local_read, pending).with_idle_timeout(idle);
        let server_reader = PeekReader::new(remote_read).with_idle_timeout(idle);
        let client_writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(local_write));

        let state = Arc::new(LinkState::new(info, intercepted));
        let rl = {
            let handler = self.clone();
            let state = state.clone();
            let client_writer = client_writer.clone();
            tokio::spawn(async move {
                handler
                    .process_responses(&state, server_reader, client_writer)
                    .await
            })
        };

        self.process_requests(&state, client_reader, remote_write, client_writer)
            .await;
        if let Err(e) = rl.await {
            warn!(error = %e, "Response task failed");
        }
        state.protocol()
    }

    /// Hands the link to the interceptor when its ClientHello names an
    /// opted-in server.
    async fn try_intercept(
        &self,
        mut local: PeekReader<BoxedStream>,
        remote: BoxedStream,
        info: &LinkInfo,
    ) -> io::Result<(PeekReader<BoxedStream>, BoxedStream, bool)> {
        let Some(interceptor) = self.interceptor.clone() else {
            return Ok((local, remote, false));
        };
        // Only wait for a ClientHello on ports some hostname entry covers
        let port = info.dest_port().unwrap_or(443);
        if !self.mitm_filter.covers_port(port) {
            return Ok((local, remote, false));
        }

        let sniff_timeout = Duration::from_secs(self.config.timeouts.sniff);
        let hello = match timeout(sniff_timeout, sniff::sniff_tls_client_hello(&mut local)).await {
            Ok(Ok(Some(hello))) => hello,
            Ok(Ok(None)) | Err(_) => return Ok((local, remote, false)),
            Ok(Err(e)) => return Err(e),
        };

        if !self.mitm_filter.matches(&hello.server_name, port)
            || !interceptor.intercepts(&hello.server_name, port)
        {
            return Ok((local, remote, false));
        }

        info!(
            src = %info.laddr,
            dest = %info.raddr,
            server_name = %hello.server_name,
            "Intercepting TLS connection"
        );
        let (local, remote) = interceptor
            .intercept(Box::new(local), remote, hello.server_name)
            .await?;
        Ok((PeekReader::new(local), remote, true))
    }

    async fn classify(&self, reader: &mut ClientReader, intercepted: bool) -> io::Result<Protocol> {
        if !intercepted && sniff::sniff_tls_record(reader).await? {
            return Ok(Protocol::Tls);
        }
        if sniff::sniff_http_request_line(reader).await? {
            return Ok(if intercepted {
                Protocol::Https
            } else {
                Protocol::Http
            });
        }
        Ok(Protocol::Tcp)
    }

    /// Client → server direction.
    async fn process_requests(
        &self,
        state: &LinkState,
        mut reader: ClientReader,
        mut server: WriteHalf<BoxedStream>,
        client: SharedWriter,
    ) {
        let info = &state.info;
        let gate = GateGuard(&state.gate);
        let idle = Duration::from_secs(self.config.timeouts.idle);
        let sniff_timeout = Duration::from_secs(self.config.timeouts.sniff);

        let protocol = match timeout(sniff_timeout, self.classify(&mut reader, state.intercepted)).await
        {
            Ok(Ok(protocol)) => {
                if !protocol.is_http() {
                    self.cache.add(&info.raddr);
                }
                protocol
            }
            Ok(Err(e)) => {
                debug!(src = %info.laddr, error = %e, "Client closed before classification");
                Protocol::Tcp
            }
            Err(_) => {
                debug!(src = %info.laddr, dest = %info.raddr, "Sniff timed out");
                Protocol::Tcp
            }
        };

        debug!(src = %info.laddr, dest = %info.raddr, protocol = protocol.as_str(), "Connection classified");
        state.set_protocol(protocol);
        self.events.emit(Event::ProtocolDetected {
            src: info.laddr.clone(),
            dest: info.raddr.clone(),
            protocol,
        });
        state.gate.fire(protocol);
        drop(gate);

        if !protocol.is_http() {
            self.fallback(protocol.as_str());
            self.relay_to_server(reader, server, idle).await;
            return;
        }

        let max_header_size = self.config.max_header_size;
        loop {
            if state.is_skipped() {
                debug!(dest = %info.raddr, "Rewriting skipped for the rest of the connection");
                break;
            }

            match sniff::sniff_http_method(&mut reader).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(src = %info.laddr, "Non-HTTP data after a request");
                    self.fallback("not_http");
                    break;
                }
                Err(e) if is_idle(&e) => {
                    debug!(src = %info.laddr, "Client idle timeout");
                    let _ = server.shutdown().await;
                    return;
                }
                Err(e) => {
                    debug!(src = %info.laddr, error = %e, "Client stream ended");
                    break;
                }
            }

            let head = match http::read_head(&mut reader, max_header_size).await {
                Ok(head) => head,
                Err(HeadError::Io(e)) if is_idle(&e) => {
                    debug!(src = %info.laddr, "Client idle timeout inside a request head");
                    let _ = server.shutdown().await;
                    return;
                }
                Err(HeadError::Io(e)) => {
                    debug!(src = %info.laddr, error = %e, "Client stream ended inside a request head");
                    break;
                }
                Err(e) => {
                    debug!(src = %info.laddr, error = %e, "Unparseable request head, relaying raw");
                    self.fallback("bad_request");
                    break;
                }
            };

            let framing = head.request_framing();
            let tunnel = head.is_websocket_upgrade() || head.method() == b"CONNECT";
            let body = match self.buffer_body(&mut reader, framing, Direction::Request).await {
                Ok(body) => body,
                Err(e) if is_idle(&e) => {
                    debug!(src = %info.laddr, "Client idle timeout inside a request body");
                    let _ = server.shutdown().await;
                    return;
                }
                Err(e) => {
                    // Nothing of the body was consumed, the head goes out as received
                    debug!(src = %info.laddr, error = %e, "Request body cut short, relaying raw");
                    if server.write_all(head.as_bytes()).await.is_err() {
                        let _ = server.shutdown().await;
                        return;
                    }
                    break;
                }
            };

            let mut meta = Metadata::for_request(info.clone(), head, body);
            let decision = self.rewriter.rewrite_request(&mut meta);
            if decision.need_cache {
                self.cache.add(&info.raddr);
            }
            if decision.need_skip {
                state.skip();
            }
            self.report(&mut meta, &decision);

            let skip_message = if decision.redirect {
                if let Some(reply) = meta.take_reply() {
                    let mut out = client.lock().await;
                    if let Err(e) = out.write_all(&reply).await {
                        debug!(src = %info.laddr, error = %e, "Failed to send redirect");
                        drop(out);
                        let _ = server.shutdown().await;
                        return;
                    }
                }
                info!(src = %info.laddr, url = meta.url(), "Request redirected");
                true
            } else {
                match decision.verdict {
                    Verdict::Forward => false,
                    Verdict::Drop => {
                        info!(src = %info.laddr, url = meta.url(), "Request dropped");
                        true
                    }
                    Verdict::Reject => {
                        info!(src = %info.laddr, url = meta.url(), "Request rejected");
                        let _ = server.shutdown().await;
                        return;
                    }
                }
            };
            if skip_message {
                match self.discard_body(&mut reader, framing, &meta).await {
                    Ok(()) => continue,
                    Err(e) if is_idle(&e) => {
                        let _ = server.shutdown().await;
                        return;
                    }
                    Err(_) => break,
                }
            }

            let (Some(head), body) = meta.into_request_parts() else {
                break;
            };
            if self.rewriter.serves_response() {
                state.push_request(head.clone());
            }

            match send_message(&mut reader, &head, body, framing, &mut Sink::Server(&mut server)).await
            {
                Ok(()) => {}
                Err(RelayError::Read(e)) if is_idle(&e) => {
                    debug!(src = %info.laddr, "Client idle timeout inside a request body");
                    let _ = server.shutdown().await;
                    return;
                }
                Err(RelayError::Read(e)) => {
                    debug!(src = %info.laddr, error = %e, "Request body framing lost, relaying raw");
                    self.fallback("bad_request_body");
                    break;
                }
                Err(RelayError::Write(e)) => {
                    debug!(src = %info.laddr, dest = %info.raddr, error = %e, "Request forwarding failed");
                    let _ = server.shutdown().await;
                    return;
                }
            }

            if tunnel {
                if head.is_websocket_upgrade() {
                    state.set_protocol(Protocol::WebSocket);
                }
                debug!(dest = %info.raddr, "Protocol switch, relaying raw");
                break;
            }
        }

        self.relay_to_server(reader, server, idle).await;
    }

    /// Server → client direction.
    async fn process_responses(
        &self,
        state: &LinkState,
        mut reader: ServerReader,
        client: SharedWriter,
    ) {
        let idle = Duration::from_secs(self.config.timeouts.idle);
        if !self.rewriter.serves_response() {
            self.relay_to_client(reader, &client, idle).await;
            return;
        }

        let protocol = state.gate.wait().await;
        if !protocol.is_http() {
            self.relay_to_client(reader, &client, idle).await;
            return;
        }

        let info = &state.info;
        loop {
            if state.is_skipped() || state.protocol() == Protocol::WebSocket {
                break;
            }

            match sniff::sniff_http_response(&mut reader).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(dest = %info.raddr, "Non-HTTP data from server");
                    self.fallback("not_http_response");
                    break;
                }
                Err(e) if is_idle(&e) => {
                    debug!(dest = %info.raddr, "Server idle timeout");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
                Err(e) => {
                    debug!(dest = %info.raddr, error = %e, "Server stream ended");
                    break;
                }
            }

            let head = match http::read_head(&mut reader, self.config.max_header_size).await {
                Ok(head) => head,
                Err(HeadError::Io(e)) if is_idle(&e) => {
                    debug!(dest = %info.raddr, "Server idle timeout inside a response head");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
                Err(HeadError::Io(e)) => {
                    debug!(dest = %info.raddr, error = %e, "Server stream ended inside a response head");
                    break;
                }
                Err(e) => {
                    debug!(dest = %info.raddr, error = %e, "Unparseable response head, relaying raw");
                    self.fallback("bad_response");
                    break;
                }
            };

            let status = head.status_code();
            let request = state.pair_response(status);
            let framing = head.response_framing(request.as_ref().map(|r| r.method()));
            let body = match self.buffer_body(&mut reader, framing, Direction::Response).await {
                Ok(body) => body,
                Err(e) if is_idle(&e) => {
                    debug!(dest = %info.raddr, "Server idle timeout inside a response body");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
                Err(e) => {
                    debug!(dest = %info.raddr, error = %e, "Response body cut short, relaying raw");
                    if client.lock().await.write_all(head.as_bytes()).await.is_err() {
                        let _ = client.lock().await.shutdown().await;
                        return;
                    }
                    break;
                }
            };

            let mut meta = Metadata::for_response(info.clone(), request, head, body);
            let decision = self.rewriter.rewrite_response(&mut meta);
            self.report(&mut meta, &decision);

            match decision.verdict {
                Verdict::Forward => {}
                Verdict::Drop => {
                    info!(dest = %info.raddr, status, "Response dropped");
                    match self.discard_body(&mut reader, framing, &meta).await {
                        Ok(()) => continue,
                        Err(e) if is_idle(&e) => {
                            let _ = client.lock().await.shutdown().await;
                            return;
                        }
                        Err(_) => break,
                    }
                }
                Verdict::Reject => {
                    info!(dest = %info.raddr, status, "Response rejected");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
            }

            let (Some(head), body) = meta.into_response_parts() else {
                break;
            };

            match send_message(&mut reader, &head, body, framing, &mut Sink::Client(&client)).await {
                Ok(()) => {}
                Err(RelayError::Read(e)) if is_idle(&e) => {
                    debug!(dest = %info.raddr, "Server idle timeout inside a response body");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
                Err(RelayError::Read(e)) => {
                    debug!(dest = %info.raddr, error = %e, "Response body framing lost, relaying raw");
                    self.fallback("bad_response_body");
                    break;
                }
                Err(RelayError::Write(e)) => {
                    debug!(src = %info.laddr, error = %e, "Response forwarding failed");
                    let _ = client.lock().await.shutdown().await;
                    return;
                }
            }

            if status == 101 {
                state.set_protocol(Protocol::WebSocket);
                break;
            }
            if framing == BodyFraming::UntilClose {
                break;
            }
        }

        self.relay_to_client(reader, &client, idle).await;
    }

    /// Reads a length-framed body into memory when body rules want it.
    async fn buffer_body<R: AsyncRead + Unpin>(
        &self,
        reader: &mut PeekReader<R>,
        framing: BodyFraming,
        direction: Direction,
    ) -> io::Result<Option<Vec<u8>>> {
        match framing {
            BodyFraming::Length(n)
                if self.rewriter.needs_body(direction) && n <= self.config.max_body_size as u64 =>
            {
                Ok(Some(reader.read_bytes(n as usize).await?.to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// Skips the body of a message that will not be forwarded.
    async fn discard_body<R: AsyncRead + Unpin>(
        &self,
        reader: &mut PeekReader<R>,
        framing: BodyFraming,
        meta: &Metadata,
    ) -> io::Result<()> {
        if meta.body(meta.direction()).is_some() {
            return Ok(());
        }
        http::forward_body(reader, framing, &mut io::sink()).await
    }

    fn report(&self, meta: &mut Metadata, decision: &RewriteDecision) {
        let edits = meta.take_edits();
        if edits.is_empty() {
            if meta.direction() == Direction::Request
                && decision.verdict == Verdict::Forward
                && !decision.redirect
                && !decision.modified
            {
                self.events.emit(Event::PassThrough {
                    host: meta.host().to_string(),
                    src: meta.src_addr().to_string(),
                    user_agent: meta.user_agent().to_string(),
                });
            }
            return;
        }

        for edit in edits {
            debug!(
                host = meta.host(),
                header = %edit.header,
                original = %edit.original,
                rewritten = %edit.rewritten,
                "Header rewritten"
            );
            self.events.emit(Event::Rewrite {
                host: meta.host().to_string(),
                src: meta.src_addr().to_string(),
                header: edit.header,
                original: edit.original,
                rewritten: edit.rewritten,
            });
        }
    }

    fn fallback(&self, reason: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.sniff_fallbacks.with_label_values(&[reason]).inc();
        }
    }

    fn count_bytes(&self, direction: &str, n: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .relayed_bytes
                .with_label_values(&[direction])
                .inc_by(n as u64);
        }
    }

    async fn relay_raw(
        &self,
        local: BoxedStream,
        remote: BoxedStream,
        idle: Duration,
        info: &LinkInfo,
    ) {
        let metrics = self.metrics.as_ref().map(|m| {
            (
                m.relayed_bytes.with_label_values(&["upstream"]),
                m.relayed_bytes.with_label_values(&["downstream"]),
            )
        });
        if let Err(e) = copy_bidirectional_timeout(local, remote, idle, metrics).await {
            debug!(src = %info.laddr, dest = %info.raddr, error = %e, "Raw relay ended");
        }
    }

    /// Raw client → server copy, starting with whatever is still buffered.
    async fn relay_to_server(
        &self,
        mut reader: ClientReader,
        mut server: WriteHalf<BoxedStream>,
        idle: Duration,
    ) {
        let result = async {
            let pending = reader.take_buffered();
            if !pending.is_empty() {
                server.write_all(&pending).await?;
                self.count_bytes("upstream", pending.len());
            }
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = timeout(idle, reader.read(&mut buf)).await??;
                if n == 0 {
                    break;
                }
                server.write_all(&buf[..n]).await?;
                self.count_bytes("upstream", n);
            }
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = result {
            debug!(error = %e, "Upstream relay ended");
        }
        let _ = server.shutdown().await;
    }

    /// Raw server → client copy. The client writer is locked per chunk.
    async fn relay_to_client(&self, mut reader: ServerReader, client: &SharedWriter, idle: Duration) {
        let result = async {
            let pending = reader.take_buffered();
            if !pending.is_empty() {
                client.lock().await.write_all(&pending).await?;
                self.count_bytes("downstream", pending.len());
            }
            let mut buf = [0u8; RELAY_BUFFER_SIZE];
            loop {
                let n = timeout(idle, reader.read(&mut buf)).await??;
                if n == 0 {
                    break;
                }
                client.lock().await.write_all(&buf[..n]).await?;
                self.count_bytes("downstream", n);
            }
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = result {
            debug!(error = %e, "Downstream relay ended");
        }
        let _ = client.lock().await.shutdown().await;
    }
}

#[inline]
fn is_idle(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
}

/// Where a parsed message is written. The client side is shared with the
/// request loop, so it is locked per write and never across a read.
enum Sink<'a> {
    Server(&'a mut WriteHalf<BoxedStream>),
    Client(&'a SharedWriter),
}

impl Sink<'_> {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Sink::Server(out) => out.write_all(data).await,
            Sink::Client(out) => out.lock().await.write_all(data).await,
        }
    }
}

enum RelayError {
    Read(io::Error),
    Write(io::Error),
}

/// Writes a head, then its buffered body or the body still on `reader`.
///
/// On a read error everything not yet written is still buffered in
/// `reader`.
async fn send_message<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
    head: &HttpHead,
    body: Option<Vec<u8>>,
    framing: BodyFraming,
    out: &mut Sink<'_>,
) -> Result<(), RelayError> {
    out.write_all(head.as_bytes())
        .await
        .map_err(RelayError::Write)?;
    if let Some(body) = body {
        return out.write_all(&body).await.map_err(RelayError::Write);
    }

    let mut stream = BodyStream::new(framing);
    while let Some(piece) = stream.next_piece(reader).await.map_err(RelayError::Read)? {
        out.write_all(&piece).await.map_err(RelayError::Write)?;
    }
    Ok(())
}

async fn copy_bidirectional_timeout<T, U>(
    client: T,
    server: U,
    idle_timeout: Duration,
    metrics: Option<(prometheus::IntCounter, prometheus::IntCounter)>,
) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut server_read, mut server_write) = io::split(server);

    let client_to_server = async {
        let mut buf = [0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = timeout(idle_timeout, client_read.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            server_write.write_all(&buf[..n]).await?;
            if let Some((counter, _)) = &metrics {
                counter.inc_by(n as u64);
            }
        }
        server_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    let server_to_client = async {
        let mut buf = [0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = timeout(idle_timeout, server_read.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
            if let Some((_, counter)) = &metrics {
                counter.inc_by(n as u64);
            }
        }
        client_write.shutdown().await?;
        Ok::<_, io::Error>(())
    };

    tokio::try_join!(client_to_server, server_to_client)?;
    Ok(())
}
