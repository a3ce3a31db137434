//! Call framing.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON document.
//! A connection carries any number of request/response exchanges in order.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::Status;
use crate::identity::PeerIdentity;
use crate::interceptor::{Call, CallKind, CallResult, Metadata, Pipeline, Reply};
use crate::Result;

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Codec shared by both ends
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Method name
    pub method: String,
    /// Call shape
    #[serde(default)]
    pub kind: CallKind,
    /// Call metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Request messages
    #[serde(default)]
    pub messages: Vec<Vec<u8>>,
}

impl RequestFrame {
    /// Inbound call from this frame, attributed to the verified `peer`
    #[must_use]
    pub fn into_call(self, peer: PeerIdentity) -> Call {
        let mut call = Call::new(self.method).with_peer(peer);
        call.kind = self.kind;
        call.metadata = self
            .metadata
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        call.messages = self.messages.into_iter().map(Bytes::from).collect();
        call
    }
}

/// Server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Set when the call was rejected or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Response metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Response messages
    #[serde(default)]
    pub messages: Vec<Vec<u8>>,
}

impl From<CallResult> for ResponseFrame {
    fn from(result: CallResult) -> Self {
        match result {
            Ok(reply) => Self {
                status: None,
                metadata: reply.metadata,
                messages: reply.messages.into_iter().map(|m| m.to_vec()).collect(),
            },
            Err(status) => Self {
                status: Some(status),
                metadata: Metadata::new(),
                messages: Vec::new(),
            },
        }
    }
}

impl ResponseFrame {
    /// Back to a call result
    pub fn into_result(self) -> CallResult {
        match self.status {
            Some(status) => Err(status),
            None => Ok(Reply {
                metadata: self.metadata,
                messages: self.messages.into_iter().map(Bytes::from).collect(),
            }),
        }
    }
}

/// Serve calls on an authenticated stream until the peer hangs up.
pub async fn serve_connection<S>(stream: S, peer: PeerIdentity, pipeline: &Pipeline) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, codec());
    let mut served = 0_u64;

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<RequestFrame>(&frame) {
            Ok(request) => {
                ResponseFrame::from(pipeline.dispatch(request.into_call(peer.clone())).await)
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed request frame");
                ResponseFrame::from(Err(Status::invalid_argument("malformed request frame")))
            }
        };
        framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
        served += 1;
    }

    debug!(peer = %peer, calls = served, "Connection closed by peer");
    Ok(())
}
