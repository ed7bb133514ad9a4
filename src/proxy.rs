//! HTTP/HTTPS interception proxy engine
//!
//! Accepts proxy-form HTTP requests and `CONNECT` tunnels. With HTTPS
//! interception enabled, tunnels are terminated with a leaf certificate
//! minted for the target host and the decrypted requests are forwarded over
//! a validated TLS connection to the origin. Every completed request/response
//! pair is persisted to the traffic store and announced on the event bus.

use crate::cert_minter::CertMinter;
use crate::config::ProxyConfig;
use crate::events::EventBus;
use crate::schema::{
    content_type_of, ErrorKind, Exchange, Headers, OpenRequest, ProxyEvent, ResponseRecord,
    ERROR_KIND_HEADER, TRUNCATED_HEADER,
};
use crate::store::TrafficStore;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;

type BoxBody = UnsyncBoxBody<Bytes, hyper::Error>;
type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// In-flight connections get this long to finish after `stop()`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Hop-by-hop headers: stripped before forwarding, preserved in capture.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub struct ProxyEngine {
    config: ProxyConfig,
    minter: Arc<CertMinter>,
    store: Arc<TrafficStore>,
    bus: EventBus,
    upstream_tls: Option<rustls::ClientConfig>,
}

/// Handle to a running engine: the bound address, the advertised
/// certificate-download URL, and graceful shutdown.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    cert_download_url: String,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where clients can fetch the root CA. The download page itself is
    /// served by an external helper on the sibling port; this is
    /// pass-through metadata.
    pub fn cert_download_url(&self) -> &str {
        &self.cert_download_url
    }

    /// Stop accepting, give in-flight connections the grace period, then
    /// drop stragglers. Their pending exchanges are closed out as they die.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let deadline = SHUTDOWN_GRACE + Duration::from_secs(1);
        if tokio::time::timeout(deadline, &mut self.task).await.is_err() {
            tracing::warn!("Accept task did not wind down in time, aborting");
            self.task.abort();
        }
    }
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        minter: Arc<CertMinter>,
        store: Arc<TrafficStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            minter,
            store,
            bus,
            upstream_tls: None,
        }
    }

    /// Replace the upstream TLS trust configuration. The default validates
    /// origins against the OS trust store; embedders with private CAs can
    /// supply their own roots here.
    pub fn with_upstream_tls_config(mut self, tls: rustls::ClientConfig) -> Self {
        self.upstream_tls = Some(tls);
        self
    }

    /// Bind the listener and start serving. Fails if the port is taken, and
    /// reports CA or trust-store problems before accepting anything.
    pub async fn start(self) -> Result<ProxyHandle> {
        let addr = SocketAddr::new(self.config.host, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        let cert_download_url = format!(
            "http://{}:{}",
            local_non_loopback_ipv4(),
            local_addr.port().saturating_add(1)
        );

        let client = build_upstream_client(&self.config, self.upstream_tls)?;
        let shared = Arc::new(Shared {
            config: self.config,
            minter: self.minter,
            store: self.store,
            bus: self.bus,
            client,
        });

        tracing::info!("Proxy listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(ProxyHandle {
            local_addr,
            cert_download_url,
            shutdown: shutdown_tx,
            task,
        })
    }
}

struct Shared {
    config: ProxyConfig,
    minter: Arc<CertMinter>,
    store: Arc<TrafficStore>,
    bus: EventBus,
    client: UpstreamClient,
}

fn build_upstream_client(
    config: &ProxyConfig,
    upstream_tls: Option<rustls::ClientConfig>,
) -> Result<UpstreamClient> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(Duration::from_millis(
        config.upstream_connect_timeout_ms,
    )));

    let https = match upstream_tls {
        Some(tls) => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http),
        None => hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load the OS trust store")?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http),
    };

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    let shared = shared.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, shared).await {
                            tracing::debug!("Connection from {} ended: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            },
            _ = shutdown.changed() => break,
        }
        // Reap finished connection tasks so the set does not grow unbounded
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    if !connections.is_empty() {
        tracing::info!(
            "Waiting up to {:?} for {} in-flight connections",
            SHUTDOWN_GRACE,
            connections.len()
        );
    }
    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            joined = connections.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            _ = &mut grace => {
                tracing::warn!("Dropping {} connections still in flight", connections.len());
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                break;
            }
        }
    }
    tracing::info!("Proxy stopped");
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let idle = Duration::from_millis(shared.config.idle_timeout_ms);
    let io = TokioIo::new(stream);

    let svc_shared = shared.clone();
    let service = service_fn(move |req| proxy_request(req, svc_shared.clone()));

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(idle)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;

    Ok(())
}

async fn proxy_request(
    req: Request<Incoming>,
    shared: Arc<Shared>,
) -> Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::info!("{} {}", method, uri);

    if method == Method::CONNECT {
        return Ok(handle_connect(req, shared).await);
    }

    // A proxy only accepts absolute-form targets outside of CONNECT
    if uri.scheme().is_none() {
        return Ok(status_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use absolute-form URIs",
        ));
    }

    Ok(forward_request(req, uri, shared).await)
}

async fn handle_connect(req: Request<Incoming>, shared: Arc<Shared>) -> Response<BoxBody> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => {
            tracing::warn!("CONNECT missing authority");
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority");
        }
    };

    tracing::info!("CONNECT to {}", authority);

    // Extract the upgrade future before the request is consumed; hyper
    // completes it once the 200 below is flushed.
    let upgrade = hyper::upgrade::on(req);

    if shared.config.enable_https {
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = intercept_tls(upgraded, authority.clone(), shared).await {
                        tracing::debug!("Interception of {} ended: {:#}", authority, e);
                    }
                }
                Err(e) => tracing::error!("CONNECT upgrade failed for {}: {}", authority, e),
            }
        });
    } else {
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel(upgraded, authority.clone()).await {
                        tracing::debug!("Tunnel to {} ended: {:#}", authority, e);
                    }
                }
                Err(e) => tracing::error!("CONNECT upgrade failed for {}: {}", authority, e),
            }
        });
    }

    // 200 Connection Established
    Response::new(full(""))
}

/// Opaque splice used when HTTPS interception is disabled. Nothing inside
/// the tunnel is captured.
async fn tunnel(upgraded: hyper::upgrade::Upgraded, authority: String) -> Result<()> {
    let target = TcpStream::connect(&authority)
        .await
        .with_context(|| format!("Failed to reach {authority}"))?;

    let mut client = TokioIo::new(upgraded);
    let (mut server_read, mut server_write) = target.into_split();
    let (mut client_read, mut client_write) = tokio::io::split(&mut client);

    let client_to_server = tokio::io::copy(&mut client_read, &mut server_write);
    let server_to_client = tokio::io::copy(&mut server_read, &mut client_write);

    tokio::try_join!(client_to_server, server_to_client)?;

    Ok(())
}

/// Terminate the client's TLS with a minted leaf, then serve the decrypted
/// requests in a keep-alive loop, forwarding each to the real origin.
async fn intercept_tls(
    upgraded: hyper::upgrade::Upgraded,
    authority: String,
    shared: Arc<Shared>,
) -> Result<()> {
    let (connect_host, connect_port) = split_authority(&authority);

    let acceptor = LazyConfigAcceptor::new(
        rustls::server::Acceptor::default(),
        TokioIo::new(upgraded),
    );
    // A client that cannot even deliver a ClientHello gets dropped without
    // leaving an exchange behind.
    let start = match acceptor.await {
        Ok(start) => start,
        Err(e) => {
            tracing::debug!("No ClientHello from tunnel to {}: {}", authority, e);
            return Ok(());
        }
    };

    // SNI wins over the CONNECT target when the two disagree
    let sni = start.client_hello().server_name().map(str::to_string);
    let hostname = sni.unwrap_or_else(|| connect_host.clone());

    let server_config = shared
        .minter
        .server_config_for(&hostname)
        .await
        .with_context(|| format!("Failed to mint identity for {hostname}"))?;

    let tls_stream = match start.into_stream(server_config).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Client TLS handshake failed for {}: {}", hostname, e);
            return Ok(());
        }
    };

    let origin = if connect_port == 443 {
        hostname.clone()
    } else {
        format!("{hostname}:{connect_port}")
    };

    let idle = Duration::from_millis(shared.config.idle_timeout_ms);
    let io = TokioIo::new(tls_stream);
    let svc_shared = shared.clone();
    let service = service_fn(move |req| {
        let origin = origin.clone();
        let shared = svc_shared.clone();
        async move { Ok::<_, Infallible>(intercepted_request(req, origin, shared).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(idle)
        .serve_connection(io, service)
        .await
        .context("Intercepted connection failed")?;

    Ok(())
}

/// Rebuild the absolute HTTPS URL for a decrypted origin-form request and
/// forward it.
async fn intercepted_request(
    req: Request<Incoming>,
    origin: String,
    shared: Arc<Shared>,
) -> Response<BoxBody> {
    if req.method() == Method::CONNECT {
        return status_response(StatusCode::BAD_REQUEST, "nested CONNECT is not supported");
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("https://{origin}{path_and_query}");

    match url.parse::<Uri>() {
        Ok(target) => forward_request(req, target, shared).await,
        Err(e) => {
            tracing::warn!("Rejecting unparseable intercepted target {}: {}", url, e);
            status_response(StatusCode::BAD_REQUEST, "invalid request target")
        }
    }
}

/// Forward one request to its origin, capturing both halves of the exchange
/// and emitting lifecycle events. Never fails the connection: upstream
/// problems become synthesized 502s.
async fn forward_request(
    req: Request<Incoming>,
    target: Uri,
    shared: Arc<Shared>,
) -> Response<BoxBody> {
    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    let started = Instant::now();
    let cap = shared.config.capture_body_cap_bytes;

    let (parts, body) = req.into_parts();
    let wire_request_headers = headers_to_map(&parts.headers);

    let host = target
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let path = target
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = target.to_string();

    // The request body has to be replayable for capture, so collect it
    // before dispatch; only the first `cap` bytes are stored.
    let (body_bytes, client_gone) = match body.collect().await {
        Ok(collected) => (collected.to_bytes(), false),
        Err(e) => {
            tracing::debug!("Request body for {} was interrupted: {}", url, e);
            (Bytes::new(), true)
        }
    };
    let request_truncated = body_bytes.len() > cap;

    let mut stored_request_headers = wire_request_headers;
    if request_truncated {
        stored_request_headers.insert(TRUNCATED_HEADER.to_string(), "true".to_string());
    }

    let open = OpenRequest {
        timestamp_ms,
        method: parts.method.to_string(),
        url: url.clone(),
        host,
        path,
        request_headers: stored_request_headers,
        request_body: if body_bytes.is_empty() {
            None
        } else {
            Some(body_bytes[..body_bytes.len().min(cap)].to_vec())
        },
    };

    // A store failure is fatal for the exchange but not for the traffic:
    // the request is still forwarded, just uncaptured.
    let exchange = match shared.store.insert_open(&open) {
        Ok(id) => {
            shared.bus.emit(ProxyEvent::RequestStarted {
                id,
                exchange: Exchange::from_open(id, &open),
            });
            Some(Arc::new(OpenExchange {
                id,
                started,
                store: shared.store.clone(),
                bus: shared.bus.clone(),
                done: AtomicBool::new(false),
            }))
        }
        Err(e) => {
            tracing::error!("Failed to open exchange for {}: {}", url, e);
            shared.bus.emit(ProxyEvent::RequestFailed {
                id: 0,
                error: ErrorKind::StoreWrite,
            });
            None
        }
    };

    if client_gone {
        if let Some(exchange) = &exchange {
            exchange.finish(0, Headers::new(), None, false, Some(ErrorKind::ClientDisconnect));
        }
        return status_response(StatusCode::BAD_REQUEST, "request body was interrupted");
    }

    // Strip hop-by-hop headers for the upstream copy; everything else,
    // including Host and Content-Length, is relayed as received.
    let mut builder = Request::builder().method(parts.method.clone()).uri(target);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    let upstream_req = match builder.body(Full::new(body_bytes)) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Could not re-serialize request for {}: {}", url, e);
            return fail_exchange(&exchange, ErrorKind::UpstreamProtocol);
        }
    };

    let header_timeout = Duration::from_millis(shared.config.upstream_header_timeout_ms);
    let response = match tokio::time::timeout(header_timeout, shared.client.request(upstream_req)).await
    {
        Err(_) => {
            tracing::warn!("Upstream response headers for {} timed out", url);
            return fail_exchange(&exchange, ErrorKind::Timeout);
        }
        Ok(Err(e)) => {
            let kind = classify_upstream_error(&e);
            tracing::warn!("Upstream request to {} failed ({}): {:#}", url, kind, e);
            return fail_exchange(&exchange, kind);
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    let (resp_parts, resp_body) = response.into_parts();
    let wire_response_headers = headers_to_map(&resp_parts.headers);

    let mut relay = Response::builder().status(status);
    for (name, value) in resp_parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            relay = relay.header(name, value);
        }
    }

    // Responses with nothing to stream complete right away; everything else
    // is teed through the capture body and completed on the final frame.
    let relay_body = if resp_body.is_end_stream() {
        if let Some(exchange) = &exchange {
            exchange.finish(status.as_u16(), wire_response_headers, None, false, None);
        }
        full("")
    } else {
        CaptureBody::new(
            resp_body,
            cap,
            exchange.clone(),
            status.as_u16(),
            wire_response_headers,
        )
        .boxed_unsync()
    };

    match relay.body(relay_body) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Failed to relay response for {}: {}", url, e);
            status_response(StatusCode::BAD_GATEWAY, "failed to relay upstream response")
        }
    }
}

/// Close out a failed exchange and synthesize the 502 the client sees.
fn fail_exchange(exchange: &Option<Arc<OpenExchange>>, kind: ErrorKind) -> Response<BoxBody> {
    if let Some(exchange) = exchange {
        let mut headers = Headers::new();
        headers.insert(ERROR_KIND_HEADER.to_string(), kind.as_str().to_string());
        exchange.finish(StatusCode::BAD_GATEWAY.as_u16(), headers, None, false, Some(kind));
    }

    let mut response = Response::new(full(format!("upstream request failed: {kind}")));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        HeaderName::from_static(ERROR_KIND_HEADER),
        HeaderValue::from_static(kind.as_str()),
    );
    response
}

fn status_response(code: StatusCode, message: &str) -> Response<BoxBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = code;
    response
}

/// An exchange whose response half is still pending. Completion goes
/// through `finish` exactly once; if the owner is dropped first (client
/// disconnect, task cancelled during shutdown), the record is closed out
/// with status 0.
struct OpenExchange {
    id: i64,
    started: Instant,
    store: Arc<TrafficStore>,
    bus: EventBus,
    done: AtomicBool,
}

impl OpenExchange {
    fn finish(
        &self,
        status: u16,
        mut response_headers: Headers,
        body: Option<Bytes>,
        truncated: bool,
        error: Option<ErrorKind>,
    ) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        if truncated {
            response_headers.insert(TRUNCATED_HEADER.to_string(), "true".to_string());
        }
        if let Some(kind) = error {
            response_headers.insert(ERROR_KIND_HEADER.to_string(), kind.as_str().to_string());
        }

        let record = ResponseRecord {
            status,
            content_type: content_type_of(&response_headers),
            response_body: body.map(|b| b.to_vec()),
            response_headers,
            duration_ms: self.started.elapsed().as_millis() as i64,
        };

        match self.store.complete(self.id, &record) {
            Ok(_) => {
                if let Some(kind) = error {
                    self.bus.emit(ProxyEvent::RequestFailed {
                        id: self.id,
                        error: kind,
                    });
                } else {
                    match self.store.get_by_id(self.id) {
                        Ok(Some(exchange)) => self.bus.emit(ProxyEvent::RequestCompleted {
                            id: self.id,
                            exchange,
                        }),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("Failed to read back exchange {}: {}", self.id, e);
                            self.bus.emit(ProxyEvent::RequestFailed {
                                id: self.id,
                                error: ErrorKind::StoreWrite,
                            });
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to persist exchange {}: {}", self.id, e);
                self.bus.emit(ProxyEvent::RequestFailed {
                    id: self.id,
                    error: ErrorKind::StoreWrite,
                });
            }
        }
    }
}

impl Drop for OpenExchange {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            tracing::debug!("Exchange {} dropped before the response completed", self.id);
            self.finish(0, Headers::new(), None, false, Some(ErrorKind::ClientDisconnect));
        }
    }
}

struct PendingCompletion {
    exchange: Arc<OpenExchange>,
    status: u16,
    response_headers: Headers,
}

/// Response body tee: frames stream through to the client unchanged while
/// the first `cap` bytes accumulate for capture. The exchange completes on
/// the final frame; an upstream mid-stream error closes it out as a
/// protocol failure.
struct CaptureBody {
    inner: Incoming,
    captured: BytesMut,
    cap: usize,
    truncated: bool,
    pending: Option<PendingCompletion>,
}

impl CaptureBody {
    fn new(
        inner: Incoming,
        cap: usize,
        exchange: Option<Arc<OpenExchange>>,
        status: u16,
        response_headers: Headers,
    ) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            cap,
            truncated: false,
            pending: exchange.map(|exchange| PendingCompletion {
                exchange,
                status,
                response_headers,
            }),
        }
    }

    fn take_captured(&mut self) -> Option<Bytes> {
        if self.captured.is_empty() {
            None
        } else {
            Some(self.captured.split().freeze())
        }
    }
}

impl Body for CaptureBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if this.captured.len() < this.cap {
                        let room = this.cap - this.captured.len();
                        if data.len() > room {
                            this.captured.extend_from_slice(&data[..room]);
                            this.truncated = true;
                        } else {
                            this.captured.extend_from_slice(data);
                        }
                    } else if !data.is_empty() {
                        this.truncated = true;
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                if let Some(pending) = this.pending.take() {
                    let body = this.take_captured();
                    pending.exchange.finish(
                        pending.status,
                        pending.response_headers,
                        body,
                        this.truncated,
                        None,
                    );
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(pending) = this.pending.take() {
                    let body = this.take_captured();
                    pending.exchange.finish(
                        pending.status,
                        pending.response_headers,
                        body,
                        this.truncated,
                        Some(ErrorKind::UpstreamProtocol),
                    );
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Collapse a wire header map to name/value strings, duplicates last-wins.
fn headers_to_map(headers: &hyper::HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers.iter() {
        map.insert(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        );
    }
    map
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn split_authority(authority: &str) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), 443),
        },
        None => (authority.to_string(), 443),
    }
}

/// Map an upstream client failure to its wire-level classification.
fn classify_upstream_error(err: &hyper_util::client::legacy::Error) -> ErrorKind {
    let is_connect = err.is_connect();
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if current.downcast_ref::<rustls::Error>().is_some() {
            return ErrorKind::UpstreamTls;
        }
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            return classify_io_error(io, is_connect);
        }
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>() {
            if hyper_err.is_timeout() {
                return ErrorKind::Timeout;
            }
            if hyper_err.is_parse() || hyper_err.is_incomplete_message() {
                return ErrorKind::UpstreamProtocol;
            }
        }
        source = current.source();
    }

    if is_connect {
        ErrorKind::UpstreamConnect
    } else {
        ErrorKind::UpstreamProtocol
    }
}

fn classify_io_error(io: &std::io::Error, is_connect: bool) -> ErrorKind {
    // TLS failures surface as io errors wrapping a rustls error
    let mut source = io.source();
    while let Some(inner) = source {
        if inner.downcast_ref::<rustls::Error>().is_some() {
            return ErrorKind::UpstreamTls;
        }
        source = inner.source();
    }

    match io.kind() {
        std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => ErrorKind::UpstreamConnect,
        _ => {
            let message = io.to_string().to_lowercase();
            if message.contains("dns") || message.contains("lookup") || message.contains("resolve")
            {
                ErrorKind::DnsFailure
            } else if message.contains("certificate")
                || message.contains("tls")
                || message.contains("handshake")
            {
                ErrorKind::UpstreamTls
            } else if is_connect {
                ErrorKind::UpstreamConnect
            } else {
                ErrorKind::UpstreamProtocol
            }
        }
    }
}

/// First non-loopback IPv4 of this machine, used to build the advertised
/// certificate-download URL. A UDP connect selects the outbound interface
/// without sending any packets.
fn local_non_loopback_ipv4() -> IpAddr {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
