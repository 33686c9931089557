//! Server Supervisor: the accept loop, optional PROXY v1 preamble
//! consumption, implicit/STARTTLS TLS orchestration via SNI, the live
//! connection set with its `max_clients` admission limit, and the two-phase
//! graceful close.
//!
//! Owning the accept loop inside the library (rather than leaving it to a
//! demo binary to drive one already-accepted socket at a time) means every
//! embedder gets PROXY support, SNI cert selection, and graceful shutdown
//! for free instead of reimplementing them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ServerError;
use crate::proxy;
use crate::reply::Reply;
use crate::server::{Connection, ConnectionExit, Handler};
use crate::session::{Session, TlsInfo};

/// One SNI entry: a certificate chain and private key in PEM, keyed by the
/// servername clients present (lowercased), or `"*"` for the default
/// selected when no name matches.
#[derive(Clone)]
pub struct TlsMaterial {
    pub server_name: String,
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

impl TlsMaterial {
    pub fn default_context(cert_chain_pem: Vec<u8>, private_key_pem: Vec<u8>) -> Self {
        TlsMaterial {
            server_name: "*".into(),
            cert_chain_pem,
            private_key_pem,
        }
    }
}

fn load_certified_key(material: &TlsMaterial) -> Result<CertifiedKey, ServerError> {
    let certs = rustls_pemfile::certs(&mut &material.cert_chain_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(ServerError::Io)?;
    let key = rustls_pemfile::private_key(&mut &material.private_key_pem[..])
        .map_err(ServerError::Io)?
        .ok_or_else(|| ServerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in PEM material")))?;
    let signing_key = tokio_rustls::rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ServerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Resolves a certificate by SNI servername, falling back to `"*"`. The map
/// swaps as a whole under `update_secure_context` ; the `Arc<RustlsServerConfig>` built around
/// this resolver is handed out once and never rebuilt, so in-flight
/// handshakes are never disturbed by a later update.
struct SniResolver {
    by_name: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let by_name = self.by_name.read().ok()?;
        let requested = hello.server_name().map(|s| s.to_ascii_lowercase());
        requested.as_deref().and_then(|n| by_name.get(n)).or_else(|| by_name.get("*")).cloned()
    }
}

/// The per-connection collaborator factory: builds one `Handler` for
/// each accepted session. Any `Fn(&Session) -> H` closure implements this
/// automatically.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler + Send + 'static;

    fn build(&self, session: &Session) -> Self::Handler;
}

impl<H, F> HandlerFactory for F
where
    F: Fn(&Session) -> H + Send + Sync + 'static,
    H: Handler + Send + 'static,
{
    type Handler = H;

    fn build(&self, session: &Session) -> H {
        (self)(session)
    }
}

struct ServerInner<F> {
    config: Config,
    factory: F,
    resolver: Arc<SniResolver>,
    tls_acceptor: TlsAcceptor,
    live: std::sync::Mutex<HashSet<String>>,
}

/// An embeddable SMTP/LMTP listener. Cheap to clone; every clone
/// shares the same live-connection set and secure-context map.
pub struct Server<F> {
    inner: Arc<ServerInner<F>>,
}

impl<F> Clone for Server<F> {
    fn clone(&self) -> Self {
        Server { inner: self.inner.clone() }
    }
}

impl<F> Server<F>
where
    F: HandlerFactory,
{
    pub fn new(config: Config, factory: F) -> Self {
        let resolver = Arc::new(SniResolver {
            by_name: RwLock::new(HashMap::new()),
        });
        let tls_config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver.clone());

        Server {
            inner: Arc::new(ServerInner {
                config,
                factory,
                tls_acceptor: TlsAcceptor::from(Arc::new(tls_config)),
                resolver,
                live: std::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Atomically replace the SNI certificate map. Connections already past
    /// their handshake keep using the `CertifiedKey` they resolved;
    /// everything after this call sees the new set.
    pub fn update_secure_context(&self, materials: &[TlsMaterial]) -> Result<(), ServerError> {
        let mut built = HashMap::with_capacity(materials.len());
        for material in materials {
            built.insert(material.server_name.to_ascii_lowercase(), Arc::new(load_certified_key(material)?));
        }
        let mut guard = self
            .inner
            .resolver
            .by_name
            .write()
            .map_err(|_| ServerError::Io(std::io::Error::new(std::io::ErrorKind::Other, "secure context lock poisoned")))?;
        *guard = built;
        Ok(())
    }

    /// Start the accept loop on an already-bound listener. Returns
    /// immediately with a [`ServerHandle`] that drives graceful shutdown and
    /// surfaces listener-level errors.
    pub fn listen(&self, listener: TcpListener) -> ServerHandle {
        let stop = CancellationToken::new();
        let force_close = CancellationToken::new();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let inner = self.inner.clone();
        let accept_stop = stop.clone();
        let accept_force = force_close.clone();
        let task = tokio::spawn(accept_loop(inner, listener, accept_stop, accept_force, error_tx));

        let live: Arc<dyn LiveSet> = self.inner.clone();

        ServerHandle {
            stop,
            force_close,
            live,
            close_timeout: self.inner.config.close_timeout,
            accept_task: task,
            errors: error_rx,
        }
    }
}

/// Narrow view of [`ServerInner`] the [`ServerHandle`] needs, so the handle
/// doesn't have to carry `F` as a type parameter.
trait LiveSet: Send + Sync {
    fn is_empty(&self) -> bool;
}

impl<F: Send + Sync> LiveSet for ServerInner<F> {
    fn is_empty(&self) -> bool {
        self.live.lock().map(|set| set.is_empty()).unwrap_or(true)
    }
}

/// Handle returned by [`Server::listen`]; owns the accept loop's shutdown
/// signalling and error channel.
pub struct ServerHandle {
    stop: CancellationToken,
    force_close: CancellationToken,
    live: Arc<dyn LiveSet>,
    close_timeout: Duration,
    accept_task: tokio::task::JoinHandle<()>,
    errors: mpsc::UnboundedReceiver<ServerError>,
}

impl ServerHandle {
    /// Two-phase graceful close: stop accepting immediately, wait up
    /// to `close_timeout` for connections to finish on their own, then send
    /// `421` to whatever remains and force them closed.
    pub async fn close(mut self) {
        self.stop.cancel();

        let deadline = tokio::time::Instant::now() + self.close_timeout;
        while !self.live.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.force_close.cancel();
        let _ = (&mut self.accept_task).await;
    }

    /// Listener-level errors (accept failures) the host application may
    /// want to log or alert on.
    pub fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<ServerError> {
        &mut self.errors
    }
}

async fn accept_loop<F>(
    server: Arc<ServerInner<F>>,
    listener: TcpListener,
    stop: CancellationToken,
    force_close: CancellationToken,
    errors: mpsc::UnboundedSender<ServerError>,
) where
    F: HandlerFactory,
{
    loop {
        let (socket, peer) = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = errors.send(ServerError::Io(e));
                    continue;
                }
            },
        };

        if server.config.ignored_hosts.contains(&peer.ip()) {
            tracing::debug!(%peer, "dropping connection from ignored host");
            drop(socket);
            continue;
        }

        let admitted = {
            let mut live = server.live.lock().unwrap();
            if live.len() >= server.config.max_clients {
                false
            } else {
                live.insert(peer.to_string());
                true
            }
        };

        if !admitted {
            tokio::spawn(reject_too_many(socket));
            continue;
        }

        let server = server.clone();
        let force_close = force_close.clone();
        tokio::spawn(async move {
            let _guard = LiveGuard {
                live: server.clone(),
                key: peer.to_string(),
            };
            if let Err(e) = handle_connection(&server, socket, peer, force_close).await {
                tracing::warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

struct LiveGuard<F> {
    live: Arc<ServerInner<F>>,
    key: String,
}

impl<F> Drop for LiveGuard<F> {
    fn drop(&mut self) {
        self.live.live.lock().unwrap().remove(&self.key);
    }
}

async fn reject_too_many(mut socket: TcpStream) {
    let _ = socket.write_all(Reply::too_many_clients().to_string().as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Consume a single `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>\n` preamble
/// line, if the caller determined one is expected, generic over whatever
/// buffered stream it's reading (a raw socket for plaintext/`needs_upgrade`,
/// a TLS stream for implicit TLS).
async fn read_proxy_preamble<R>(reader: &mut R) -> Result<(std::net::IpAddr, u16), ServerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    let text = String::from_utf8_lossy(&line);
    let header = proxy::parse_proxy_line(text.trim_end())?;
    Ok((header.source_addr, header.source_port))
}

/// One accepted connection end to end: PROXY strip, TLS orchestration
/// , the STARTTLS re-entry loop, and building the
/// per-connection `Session`/`Handler` pair.
///
/// TLS orchestration has three modes: plain (STARTTLS optional, per
/// `hide_starttls`), implicit `secure` (the raw socket is wrapped in TLS
/// before a single plaintext byte is read), and `secure` with
/// `needs_upgrade` (for intermediated proxies that speak the PROXY preamble
/// in cleartext ahead of the real client's TLS session: the preamble is
/// consumed first, then the handshake happens immediately after, still
/// strictly before the greeting).
async fn handle_connection<F>(server: &Arc<ServerInner<F>>, socket: TcpStream, peer: SocketAddr, force_close: CancellationToken) -> Result<(), ServerError>
where
    F: HandlerFactory,
{
    let local = socket.local_addr()?;

    if server.config.secure && !server.config.needs_upgrade {
        let tls_stream = server.tls_acceptor.accept(socket).await.map_err(|e| ServerError::Io(e.into()))?;
        let tls_info = extract_tls_info(&tls_stream);
        let mut reader = BufReader::new(tls_stream);

        let remote = if server.config.expects_proxy(peer.ip()) {
            read_proxy_preamble(&mut reader).await?
        } else {
            (peer.ip(), peer.port())
        };

        let session = Session::new(local.ip(), local.port(), remote.0, remote.1, server.config.lmtp);
        let mut handler = server.factory.build(&session);
        let mut conn = Connection::new(&server.config, &mut handler, session);
        conn.set_shutdown(force_close);
        conn.mark_secure(tls_info);
        conn.notify_secure().await;
        return match conn.serve(reader).await? {
            ConnectionExit::Done => Ok(()),
            ConnectionExit::StartTls(_) => unreachable!("STARTTLS cannot be issued on an already-secure session"),
        };
    }

    let mut reader = BufReader::new(socket);
    let remote = if server.config.expects_proxy(peer.ip()) {
        read_proxy_preamble(&mut reader).await?
    } else {
        (peer.ip(), peer.port())
    };

    let session = Session::new(local.ip(), local.port(), remote.0, remote.1, server.config.lmtp);
    let mut handler = server.factory.build(&session);
    let mut conn = Connection::new(&server.config, &mut handler, session);
    conn.set_shutdown(force_close.clone());

    if server.config.secure {
        // needs_upgrade: the PROXY preamble, if any, is already behind us in
        // plaintext; upgrade now, before the greeting.
        let tls_stream = server.tls_acceptor.accept(reader).await.map_err(|e| ServerError::Io(e.into()))?;
        conn.mark_secure(extract_tls_info(&tls_stream));
        conn.notify_secure().await;
        match conn.serve(tls_stream).await? {
            ConnectionExit::Done => Ok(()),
            ConnectionExit::StartTls(_) => unreachable!("STARTTLS cannot be issued on an already-secure session"),
        }
    } else {
        match conn.serve(reader).await? {
            ConnectionExit::Done => Ok(()),
            ConnectionExit::StartTls(plain) => {
                let tls_stream = server.tls_acceptor.accept(plain).await.map_err(|e| ServerError::Io(e.into()))?;
                conn.mark_secure(extract_tls_info(&tls_stream));
                conn.notify_secure().await;
                conn.set_shutdown(force_close);
                match conn.serve(tls_stream).await? {
                    ConnectionExit::Done => Ok(()),
                    ConnectionExit::StartTls(_) => unreachable!("STARTTLS cannot be issued on an already-secure session"),
                }
            }
        }
    }
}

fn extract_tls_info<S>(tls_stream: &tokio_rustls::server::TlsStream<S>) -> TlsInfo {
    let (_, conn) = tls_stream.get_ref();
    TlsInfo {
        protocol_version: conn.protocol_version().map(|v| format!("{v:?}")).unwrap_or_else(|| "unknown".into()),
        cipher_suite: conn.negotiated_cipher_suite().map(|c| format!("{:?}", c.suite())).unwrap_or_else(|| "unknown".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_uses_wildcard_name() {
        let m = TlsMaterial::default_context(vec![1], vec![2]);
        assert_eq!(m.server_name, "*");
    }
}
