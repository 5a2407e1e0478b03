//! Client side of the relay protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use super::protocol::{RelayRequest, RelayResponse, PROTOCOL};
use super::RelayError;
use crate::identity::PeerId;
use crate::net::{BandwidthCounter, RawStream, Stream};

/// A held reservation on a relay.
pub struct Reservation {
    relay: SocketAddr,
    control: Stream,
}

impl Reservation {
    /// Wait for the next incoming circuit; `None` once the relay closed the
    /// reservation.
    pub async fn next_incoming(&mut self) -> Result<Option<(Uuid, PeerId)>, RelayError> {
        loop {
            match self.control.recv::<RelayResponse>().await? {
                None => return Ok(None),
                Some(RelayResponse::Incoming { circuit, from }) => return Ok(Some((circuit, from))),
                Some(RelayResponse::Error { code, message }) => {
                    return Err(RelayError::Rejected { code, message })
                }
                Some(_) => continue,
            }
        }
    }

    /// Open the target side of `circuit`.
    pub async fn accept(&self, circuit: Uuid) -> Result<RawStream, RelayError> {
        let mut stream = open(self.relay).await?;
        stream.send(&RelayRequest::Accept { circuit }).await?;
        expect_connected(&mut stream).await?;
        Ok(stream.into_raw())
    }
}

/// Reserve a slot for `peer` on the relay at `relay`.
pub async fn reserve(relay: SocketAddr, peer: &PeerId) -> Result<Reservation, RelayError> {
    let mut control = open(relay).await?;
    control
        .send(&RelayRequest::Reserve { peer: peer.clone() })
        .await?;
    match control.recv::<RelayResponse>().await? {
        Some(RelayResponse::Reserved) => Ok(Reservation { relay, control }),
        Some(RelayResponse::Error { code, message }) => Err(RelayError::Rejected { code, message }),
        _ => Err(RelayError::UnexpectedReply),
    }
}

/// Open a circuit from `peer` to the reserved `target`.
pub async fn connect(
    relay: SocketAddr,
    peer: &PeerId,
    target: &PeerId,
) -> Result<(Uuid, RawStream), RelayError> {
    let mut stream = open(relay).await?;
    stream
        .send(&RelayRequest::Connect {
            peer: peer.clone(),
            target: target.clone(),
        })
        .await?;
    let circuit = expect_connected(&mut stream).await?;
    Ok((circuit, stream.into_raw()))
}

async fn open(relay: SocketAddr) -> Result<Stream, RelayError> {
    Ok(Stream::dial_metered(relay, PROTOCOL, Arc::new(BandwidthCounter::new())).await?)
}

async fn expect_connected(stream: &mut Stream) -> Result<Uuid, RelayError> {
    match stream.recv::<RelayResponse>().await? {
        Some(RelayResponse::Connected { circuit }) => Ok(circuit),
        Some(RelayResponse::Error { code, message }) => Err(RelayError::Rejected { code, message }),
        _ => Err(RelayError::UnexpectedReply),
    }
}
