//! mTLS client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::TransportClient;
use super::frame::{RequestFrame, ResponseFrame, codec};
use crate::identity::{Certificate, PeerIdentity};
use crate::interceptor::propagation::{self, OutboundPropagator};
use crate::interceptor::{CallKind, Metadata, Reply};
use crate::policy::AuthenticationPolicy;
use crate::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side of the mutually authenticated transport.
pub struct MtlsClient {
    connector: TlsConnector,
    certificate: Arc<Certificate>,
    policy: Arc<AuthenticationPolicy>,
    propagator: Option<Arc<OutboundPropagator>>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl MtlsClient {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        certificate: Arc<Certificate>,
        policy: Arc<AuthenticationPolicy>,
    ) -> Self {
        Self {
            connector: TlsConnector::from(config),
            certificate,
            policy,
            propagator: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach identity propagation metadata to every call
    #[must_use]
    pub fn with_propagator(mut self, propagator: OutboundPropagator) -> Self {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    /// Override the connect + handshake timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Certificate presented to servers
    #[must_use]
    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    /// Policy enforced on servers
    #[must_use]
    pub fn policy(&self) -> &Arc<AuthenticationPolicy> {
        &self.policy
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open an authenticated connection to `addr`.
    ///
    /// # Errors
    ///
    /// `Error::ConnectionFailed` if closed or unreachable,
    /// `Error::Unauthenticated` if the server fails verification or the
    /// allow-list.
    pub async fn connect(&self, addr: SocketAddr) -> Result<MtlsConnection> {
        if self.is_closed() {
            return Err(Error::ConnectionFailed("client is closed".into()));
        }

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionFailed(format!("connect to {addr} timed out")))?
            .map_err(|e| Error::ConnectionFailed(format!("connect to {addr}: {e}")))?;

        let server_name = ServerName::IpAddress(addr.ip().into());
        let handshake = self.connector.connect(server_name, tcp);
        let tls = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Transport(format!("TLS handshake with {addr} timed out")))?
            .map_err(|e| Error::Unauthenticated(format!("TLS handshake with {addr} failed: {e}")))?;

        let leaf = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or_else(|| Error::Unauthenticated("server presented no certificate".into()))?;
        let peer = PeerIdentity::from_der(leaf.as_ref())?;
        debug!(addr = %addr, peer = %peer, "Connected to server");

        Ok(MtlsConnection {
            framed: Framed::new(tls, codec()),
            peer,
            propagator: self.propagator.clone(),
        })
    }
}

impl TransportClient for MtlsClient {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(identity = %self.policy.owner(), "mTLS client closed");
        }
        Ok(())
    }
}

/// An open client connection.
pub struct MtlsConnection {
    framed: Framed<TlsStream<TcpStream>, LengthDelimitedCodec>,
    peer: PeerIdentity,
    propagator: Option<Arc<OutboundPropagator>>,
}

impl MtlsConnection {
    /// Verified server identity
    #[must_use]
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Unary call
    pub async fn call(&mut self, method: &str, message: impl Into<Bytes>) -> Result<Reply> {
        self.exchange(method, CallKind::Unary, vec![message.into()])
            .await
    }

    /// Streaming call: all request messages out, all response messages back
    pub async fn stream(&mut self, method: &str, messages: Vec<Bytes>) -> Result<Reply> {
        self.exchange(method, CallKind::Streaming, messages).await
    }

    async fn exchange(
        &mut self,
        method: &str,
        kind: CallKind,
        messages: Vec<Bytes>,
    ) -> Result<Reply> {
        let metadata = match &self.propagator {
            Some(propagator) => propagator
                .outbound_metadata(propagation::current().as_ref())
                .map_err(|status| Error::PermissionDenied(status.message))?,
            None => Metadata::new(),
        };

        let request = RequestFrame {
            method: method.to_owned(),
            kind,
            metadata,
            messages: messages.into_iter().map(|m| m.to_vec()).collect(),
        };
        self.framed
            .send(Bytes::from(serde_json::to_vec(&request)?))
            .await
            .map_err(|e| Error::ConnectionFailed(format!("send to {}: {e}", self.peer)))?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| Error::ConnectionFailed(format!("{} closed the connection", self.peer)))?
            .map_err(|e| Error::ConnectionFailed(format!("receive from {}: {e}", self.peer)))?;
        let response: ResponseFrame = serde_json::from_slice(&frame)?;
        response.into_result().map_err(Error::Remote)
    }

    /// Shut the connection down
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}
