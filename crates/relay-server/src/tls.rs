//! TLS termination for the relay listener.

use axum::serve::Listener;
use relay_core::config::TlsConfig;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Completed handshakes waiting for axum to pick them up.
const READY_BACKLOG: usize = 64;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("server.tls.{0} is not set")]
    MissingPath(&'static str),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Build an acceptor from the PEM certificate chain and key in `cfg`.
pub fn load_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let cert_path = cfg.cert_file.as_deref().ok_or(TlsError::MissingPath("cert_file"))?;
    let key_path = cfg.key_file.as_deref().ok_or(TlsError::MissingPath("key_file"))?;

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }
    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// TCP listener that completes TLS handshakes before handing streams to
/// axum. Handshakes run concurrently on their own tasks, so a client that
/// stalls mid-handshake never holds up the next one. Failed handshakes are
/// logged and skipped.
pub struct TlsListener {
    inner: Arc<TcpListener>,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> Self {
        let inner = Arc::new(inner);
        let (tx, ready) = mpsc::channel(READY_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(inner.clone(), acceptor, tx));
        Self {
            inner,
            ready,
            accept_task,
        }
    }
}

async fn accept_loop(
    inner: Arc<TcpListener>,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let accepted = tokio::select! {
            _ = ready.closed() => return,
            accepted = inner.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = ready.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "tls handshake failed"),
                Err(_) => debug!(%addr, "tls handshake timed out"),
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only exits once this receiver is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn localhost_config() -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_file: Some(fixture("localhost.pem")),
            key_file: Some(fixture("localhost.key")),
        }
    }

    fn connector() -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut open(&fixture("ca.pem")).unwrap()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn handshake(addr: SocketAddr) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from("localhost").unwrap();
        connector().connect(server_name, stream).await.map(|_| ())
    }

    #[tokio::test]
    async fn completes_handshake() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = TlsListener::new(tcp, load_acceptor(&localhost_config()).unwrap());
        assert_eq!(listener.local_addr().unwrap(), addr);

        let client = tokio::spawn(handshake(addr));
        let (_tls, peer) = listener.accept().await;
        assert_eq!(peer.ip(), addr.ip());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_client_does_not_hold_up_others() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = TlsListener::new(tcp, load_acceptor(&localhost_config()).unwrap());

        let _silent = TcpStream::connect(addr).await.unwrap();
        let client = tokio::spawn(handshake(addr));

        let accepted = tokio::time::timeout(Duration::from_secs(3), listener.accept()).await;
        assert!(accepted.is_ok(), "second client waited on the silent one");
        client.await.unwrap().unwrap();
    }

    #[test]
    fn missing_paths_rejected() {
        let err = load_acceptor(&TlsConfig {
            enabled: true,
            cert_file: None,
            key_file: None,
        })
        .err()
        .unwrap();
        assert!(matches!(err, TlsError::MissingPath("cert_file")));
    }

    #[test]
    fn unreadable_cert_reports_path() {
        let err = load_acceptor(&TlsConfig {
            enabled: true,
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_file: Some(PathBuf::from("/nonexistent/key.pem")),
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn pem_without_certificates_rejected() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a pem file\n").unwrap();
        std::fs::write(&key, "").unwrap();

        let err = load_acceptor(&TlsConfig {
            enabled: true,
            cert_file: Some(cert),
            key_file: Some(key),
        })
        .err()
        .unwrap();
        assert!(matches!(err, TlsError::NoCertificates(_)));
    }
}
