//! Per-connection proxy session
//!
//! A session reads the client's ClientHello, routes on its server name,
//! dials the backend and forwards the handshake flights verbatim while
//! inspecting them. Once the server's certificate (if any) has been
//! relayed the session becomes an opaque byte pipe.

use l7proxify_shared::handshake::HandshakeMessage;
use l7proxify_shared::protocol::Limits;
use l7proxify_shared::{Error, ErrorCategory, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::conn::PeerConnection;
use crate::metrics::Metrics;
use crate::policy::{RuleAction, RuleMatch, SharedRules};
use crate::verify::ChainVerifier;

/// TLS default port, used for every backend.
pub const BACKEND_PORT: u16 = 443;

const RELAY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    AwaitClientHello,
    RouteDecision,
    DialBackend,
    RelayClientHello,
    AwaitServerHello,
    RelayServerHello,
    AwaitCertificate,
    RelayCertificate,
    Relaying,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Start => "start",
            SessionState::AwaitClientHello => "await_client_hello",
            SessionState::RouteDecision => "route_decision",
            SessionState::DialBackend => "dial_backend",
            SessionState::RelayClientHello => "relay_client_hello",
            SessionState::AwaitServerHello => "await_server_hello",
            SessionState::RelayServerHello => "relay_server_hello",
            SessionState::AwaitCertificate => "await_certificate",
            SessionState::RelayCertificate => "relay_certificate",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings shared by every session of a server.
#[derive(Clone)]
pub struct SessionOptions {
    pub limits: Limits,
    /// Checks the backend certificate chain before it is relayed
    pub verifier: Option<ChainVerifier>,
    /// Bound on everything before the relay phase
    pub handshake_timeout: Option<Duration>,
    pub backend_port: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            verifier: None,
            handshake_timeout: Some(Duration::from_secs(10)),
            backend_port: BACKEND_PORT,
        }
    }
}

/// What happened to a session, returned once both sockets are closed.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: String,
    pub peer: SocketAddr,
    /// Last state entered before the session closed
    pub state: SessionState,
    pub server_name: Option<String>,
    pub decision: Option<RuleMatch>,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub error: Option<Error>,
}

pub struct ProxySession<S> {
    client: PeerConnection<S>,
    rules: SharedRules,
    options: SessionOptions,
    metrics: Metrics,
    summary: SessionSummary,
}

impl<S> ProxySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        rules: SharedRules,
        options: SessionOptions,
        metrics: Metrics,
    ) -> Self {
        Self {
            client: PeerConnection::new(stream, options.limits),
            rules,
            options,
            metrics,
            summary: SessionSummary {
                id: session_id(),
                peer,
                state: SessionState::Start,
                server_name: None,
                decision: None,
                bytes_to_backend: 0,
                bytes_from_backend: 0,
                error: None,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.summary.id
    }

    /// Drive the session to completion. Both sockets are closed on return.
    pub async fn run(self) -> SessionSummary {
        let span = info_span!("session", id = %self.summary.id, peer = %self.summary.peer);
        self.execute().instrument(span).await
    }

    async fn execute(mut self) -> SessionSummary {
        let started = Instant::now();
        self.metrics.session_opened();
        info!("session started");

        let inspected = match self.options.handshake_timeout {
            Some(limit) => timeout(limit, self.inspect())
                .await
                .unwrap_or_else(|_| Err(Error::Timeout)),
            None => self.inspect().await,
        };

        let backend = match inspected {
            Ok(backend) => backend,
            Err(e) => {
                let Self { metrics, summary, .. } = self;
                return close(summary, &metrics, Err(e));
            }
        };

        self.metrics
            .record_relay_started(started.elapsed().as_micros() as u64)
            .await;
        self.enter(SessionState::Relaying);

        let Self {
            client,
            metrics,
            mut summary,
            ..
        } = self;
        let (to_backend, from_backend) = relay(client.into_inner(), backend.into_inner()).await;
        summary.bytes_to_backend += to_backend;
        summary.bytes_from_backend += from_backend;

        close(summary, &metrics, Ok(()))
    }

    fn enter(&mut self, state: SessionState) {
        debug!(from = %self.summary.state, to = %state, "state");
        self.summary.state = state;
    }

    /// Everything up to the relay phase. Returns the backend connection with
    /// all inspected bytes already forwarded to the client.
    async fn inspect(&mut self) -> Result<PeerConnection<TcpStream>> {
        self.enter(SessionState::AwaitClientHello);
        let hello = match self.client.read_handshake().await? {
            HandshakeMessage::ClientHello(hello) => hello,
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: "ClientHello",
                    got: other.name(),
                })
            }
        };
        debug!(
            version = hello.version,
            suites = hello.cipher_suites.len(),
            alpn = ?alpn_names(&hello.alpn_protocols),
            bytes = self.client.buffered(),
            "ClientHello"
        );

        let server_name = hello.sni().ok_or(Error::MissingServerName)?.to_string();
        self.summary.server_name = Some(server_name.clone());

        self.enter(SessionState::RouteDecision);
        let decision = self.rules.evaluate(&server_name).await;
        self.metrics.record_decision(decision.as_ref().map(|m| m.action));
        let decision = decision.ok_or_else(|| Error::NoMatchingRule(server_name.clone()))?;
        info!(sni = %server_name, rule = %decision.rule, action = %decision.action, "rule matched");
        self.summary.decision = Some(decision.clone());
        if decision.action == RuleAction::Deny {
            return Err(Error::Denied {
                host: server_name,
                rule: decision.rule,
            });
        }

        self.enter(SessionState::DialBackend);
        let port = self.options.backend_port;
        let stream = TcpStream::connect((server_name.as_str(), port))
            .await
            .map_err(|e| Error::Dial {
                addr: format!("{}:{}", server_name, port),
                message: e.to_string(),
            })?;
        debug!(backend = ?stream.peer_addr().ok(), "backend connected");
        let mut backend = PeerConnection::new(stream, self.options.limits);

        self.enter(SessionState::RelayClientHello);
        let n = self.client.flush_to(backend.get_mut()).await?;
        self.summary.bytes_to_backend += n as u64;
        debug!(n, "flushed to backend");

        self.enter(SessionState::AwaitServerHello);
        let server_hello = match backend.read_handshake().await? {
            HandshakeMessage::ServerHello(hello) => hello,
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: "ServerHello",
                    got: other.name(),
                })
            }
        };
        debug!(
            version = server_hello.version,
            cipher_suite = server_hello.cipher_suite,
            alpn = ?server_hello.alpn_protocol.as_deref().map(String::from_utf8_lossy),
            "ServerHello"
        );

        // An echoed session id means an abbreviated handshake with no Certificate.
        let resumed = hello.session_id == server_hello.session_id;

        self.enter(SessionState::RelayServerHello);
        // Certificate bytes sharing a record with the ServerHello wait until
        // the chain has been checked.
        if resumed || backend.pending_handshake() == 0 {
            let n = backend.flush_to(self.client.get_mut()).await?;
            self.summary.bytes_from_backend += n as u64;
            debug!(n, "flushed to client");
        }

        if resumed {
            debug!("session id echoed, skipping certificate");
            return Ok(backend);
        }

        self.enter(SessionState::AwaitCertificate);
        let certificate = match backend.read_handshake().await? {
            HandshakeMessage::Certificate(certificate) => certificate,
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: "Certificate",
                    got: other.name(),
                })
            }
        };
        if let Some(verifier) = &self.options.verifier {
            verifier.verify(&server_name, &certificate.certificates)?;
        }

        self.enter(SessionState::RelayCertificate);
        let n = backend.flush_to(self.client.get_mut()).await?;
        self.summary.bytes_from_backend += n as u64;
        debug!(n, "flushed to client");

        Ok(backend)
    }
}

fn close(mut summary: SessionSummary, metrics: &Metrics, result: Result<()>) -> SessionSummary {
    match &result {
        Ok(()) => info!(
            to_backend = summary.bytes_to_backend,
            from_backend = summary.bytes_from_backend,
            "connection finished"
        ),
        Err(e) => {
            metrics.record_failure(e.category());
            match e.category() {
                ErrorCategory::Policy => {
                    warn!(state = %summary.state, reason = %e, "rejected")
                }
                _ if matches!(e, Error::ConnectionClosed)
                    && summary.state == SessionState::AwaitClientHello =>
                {
                    debug!("client closed before sending a ClientHello")
                }
                category => error!(
                    state = %summary.state,
                    category = category.as_str(),
                    error = %e,
                    "session failed"
                ),
            }
        }
    }

    metrics.record_bytes(summary.bytes_to_backend, summary.bytes_from_backend);
    metrics.session_closed();
    debug!(from = %summary.state, to = %SessionState::Closed, "state");
    summary.error = result.err();
    summary
}

/// Copy bytes both ways until each direction ends. A failing direction tears
/// down the other one. Returns (to_backend, from_backend).
async fn relay<S>(client: S, backend: TcpStream) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = backend.into_split();

    let to_backend = Arc::new(AtomicU64::new(0));
    let from_backend = Arc::new(AtomicU64::new(0));

    let mut upstream = tokio::spawn(
        pipe(client_read, backend_write, to_backend.clone()).in_current_span(),
    );
    let mut downstream = tokio::spawn(
        pipe(backend_read, client_write, from_backend.clone()).in_current_span(),
    );

    let (first_up, first) = tokio::select! {
        res = &mut upstream => (true, res),
        res = &mut downstream => (false, res),
    };
    let (first_name, rest, rest_name) = if first_up {
        (Direction::ToBackend, downstream, Direction::FromBackend)
    } else {
        (Direction::FromBackend, upstream, Direction::ToBackend)
    };

    let failed = !matches!(first, Ok(Ok(())));
    report(first_name, first);
    if failed {
        rest.abort();
    }
    report(rest_name, rest.await);

    (
        to_backend.load(Ordering::Relaxed),
        from_backend.load(Ordering::Relaxed),
    )
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToBackend,
    FromBackend,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ToBackend => "client->backend",
            Direction::FromBackend => "backend->client",
        }
    }
}

fn report(direction: Direction, result: std::result::Result<io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!(direction = direction.as_str(), "relay direction finished"),
        Ok(Err(e)) => warn!(direction = direction.as_str(), error = %e, "relay copy failed"),
        Err(e) if e.is_cancelled() => debug!(direction = direction.as_str(), "relay direction torn down"),
        Err(e) => error!(direction = direction.as_str(), error = %e, "relay task failed"),
    }
}

/// Copy until EOF, then half-close the writer.
async fn pipe<R, W>(mut reader: R, mut writer: W, counter: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

fn alpn_names(protocols: &[Vec<u8>]) -> Vec<std::borrow::Cow<'_, str>> {
    protocols.iter().map(|p| String::from_utf8_lossy(p)).collect()
}

/// 10 random bytes as lowercase hex.
fn session_id() -> String {
    rand::random::<[u8; 10]>()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
