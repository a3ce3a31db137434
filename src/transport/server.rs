//! mTLS server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportServer;
use super::frame::serve_connection;
use crate::identity::{Certificate, PeerIdentity};
use crate::interceptor::Pipeline;
use crate::policy::AuthenticationPolicy;
use crate::{Error, Result};

/// Default limit for a TLS handshake to complete
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream whose peer has passed the handshake and the allow-list.
#[derive(Debug)]
pub struct AuthenticatedStream<S> {
    /// Encrypted stream
    pub stream: S,
    /// Identity from the peer's verified certificate
    pub peer: PeerIdentity,
}

/// Server side of the mutually authenticated transport.
///
/// Built by [`RustlsTransportProvider`](super::RustlsTransportProvider); the
/// certificate it presents is fixed at construction, so a rotated identity
/// needs a new server.
pub struct MtlsServer {
    acceptor: TlsAcceptor,
    certificate: Arc<Certificate>,
    policy: Arc<AuthenticationPolicy>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl MtlsServer {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        certificate: Arc<Certificate>,
        policy: Arc<AuthenticationPolicy>,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            certificate,
            policy,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the handshake timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Certificate presented to clients
    #[must_use]
    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    /// Policy enforced on clients
    #[must_use]
    pub fn policy(&self) -> &Arc<AuthenticationPolicy> {
        &self.policy
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run the handshake on an accepted TCP stream.
    ///
    /// # Errors
    ///
    /// `Error::ConnectionFailed` once stopped, `Error::Transport` on timeout,
    /// `Error::Unauthenticated` if the client's certificate is missing,
    /// unverifiable or not allowed.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<AuthenticatedStream<TlsStream<TcpStream>>> {
        if self.is_stopped() {
            return Err(Error::ConnectionFailed("server is stopped".into()));
        }
        handshake(&self.acceptor, self.handshake_timeout, stream).await
    }

    /// Accept and serve connections from `listener` until stopped.
    ///
    /// Each connection runs on its own task and is not interrupted by `stop`.
    pub async fn serve(&self, listener: TcpListener, pipeline: Arc<Pipeline>) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            identity = %self.policy.owner(),
            interceptors = ?pipeline.interceptor_names(),
            "mTLS server listening"
        );

        loop {
            let (stream, remote) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let timeout = self.handshake_timeout;
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                handle_connection(acceptor, timeout, stream, remote, &pipeline).await;
            });
        }

        info!(addr = %local, "mTLS server stopped accepting connections");
        Ok(())
    }
}

impl TransportServer for MtlsServer {
    fn stop(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            debug!(identity = %self.policy.owner(), "Stopping mTLS server");
            self.shutdown.cancel();
        }
        Ok(())
    }
}

impl Drop for MtlsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    timeout: Duration,
    stream: TcpStream,
    remote: SocketAddr,
    pipeline: &Pipeline,
) {
    let authenticated = match handshake(&acceptor, timeout, stream).await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            warn!(remote = %remote, error = %e, "Connection rejected");
            return;
        }
    };
    debug!(remote = %remote, peer = %authenticated.peer, "Client authenticated");
    if let Err(e) = serve_connection(authenticated.stream, authenticated.peer, pipeline).await {
        debug!(remote = %remote, error = %e, "Connection ended with error");
    }
}

async fn handshake(
    acceptor: &TlsAcceptor,
    timeout: Duration,
    stream: TcpStream,
) -> Result<AuthenticatedStream<TlsStream<TcpStream>>> {
    let tls = tokio::time::timeout(timeout, acceptor.accept(stream))
        .await
        .map_err(|_| Error::Transport("TLS handshake timed out".into()))?
        .map_err(|e| Error::Unauthenticated(format!("TLS handshake failed: {e}")))?;

    let leaf = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| Error::Unauthenticated("client presented no certificate".into()))?;
    let peer = PeerIdentity::from_der(leaf.as_ref())?;
    Ok(AuthenticatedStream { stream: tls, peer })
}
