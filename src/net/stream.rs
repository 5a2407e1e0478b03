//! Protocol streams over host connections.
//!
//! Every connection carries one protocol. Frames are length-delimited; the
//! first frame names the protocol, and the host answers with the same name
//! when it has a handler or with `na` when it does not. After that the
//! stream carries JSON messages, or raw bytes once a relay circuit is
//! spliced.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::identity::PeerId;
use crate::net::bandwidth::{BandwidthCounter, MeteredStream};

/// Largest frame accepted on any stream.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Reply sent when no handler exists for the requested protocol.
pub const PROTOCOL_NOT_AVAILABLE: &str = "na";

/// Time allowed for protocol negotiation.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

pub type Transport = MeteredStream<TcpStream>;

/// Error type for stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol {0} not supported by remote")]
    ProtocolNotSupported(String),
    #[error("stream closed")]
    Closed,
    #[error("timed out")]
    Timeout,
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A negotiated stream speaking one protocol.
pub struct Stream {
    framed: Framed<Transport, LengthDelimitedCodec>,
    remote: SocketAddr,
    peer: Arc<OnceLock<String>>,
    protocol: String,
}

impl Stream {
    pub(crate) fn new(
        framed: Framed<Transport, LengthDelimitedCodec>,
        remote: SocketAddr,
        peer: Arc<OnceLock<String>>,
        protocol: String,
    ) -> Self {
        Self {
            framed,
            remote,
            peer,
            protocol,
        }
    }

    /// Open a stream to `addr` and negotiate `protocol`.
    pub async fn dial(addr: SocketAddr, protocol: &str) -> Result<Self, StreamError> {
        Self::dial_metered(addr, protocol, Arc::new(BandwidthCounter::new())).await
    }

    /// Like [`Stream::dial`], counting traffic into `bandwidth`.
    pub async fn dial_metered(
        addr: SocketAddr,
        protocol: &str,
        bandwidth: Arc<BandwidthCounter>,
    ) -> Result<Self, StreamError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let peer = Arc::new(OnceLock::new());
        let mut framed = Framed::new(MeteredStream::new(tcp, bandwidth, peer.clone()), codec());

        framed
            .send(Bytes::copy_from_slice(protocol.as_bytes()))
            .await?;
        let reply = tokio::time::timeout(NEGOTIATION_TIMEOUT, framed.next())
            .await
            .map_err(|_| StreamError::Timeout)?
            .ok_or(StreamError::Closed)??;
        if reply.as_ref() != protocol.as_bytes() {
            return Err(StreamError::ProtocolNotSupported(protocol.to_string()));
        }

        Ok(Self::new(framed, addr, peer, protocol.to_string()))
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Attribute this stream's traffic to `peer` from now on.
    ///
    /// Only the first call has an effect.
    pub fn identify(&self, peer: &PeerId) {
        let _ = self.peer.set(peer.to_string());
    }

    /// Peer this stream was attributed to, if any.
    pub fn peer(&self) -> Option<&str> {
        self.peer.get().map(String::as_str)
    }

    /// Send one JSON message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), StreamError> {
        let bytes = serde_json::to_vec(message)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Receive one JSON message; `None` once the remote closed the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, StreamError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
        }
    }

    /// Receive one JSON message, failing after `timeout`.
    pub async fn recv_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<T>, StreamError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| StreamError::Timeout)?
    }

    /// Drop the framing and hand back the byte stream.
    pub fn into_raw(self) -> RawStream {
        let parts = self.framed.into_parts();
        RawStream {
            io: parts.io,
            leftover: parts.read_buf,
        }
    }
}

/// Unframed connection plus any bytes already read past the last frame.
pub struct RawStream {
    pub io: Transport,
    pub leftover: BytesMut,
}
