//! Thin UDP socket wrapper (SPEC_FULL.md §4.2).

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::instrument;

use crate::config::UDP_DATAGRAM_MAX_SIZE;
use crate::error::TransportResult;
use crate::wire::Datagram;

pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    #[instrument(skip(self, datagram), fields(to = %to))]
    pub async fn send_to(&self, datagram: &Datagram, to: SocketAddr) -> TransportResult<usize> {
        let bytes = datagram.encode();
        let sent = self.socket.send_to(&bytes, to).await?;
        Ok(sent)
    }

    /// Receives one raw datagram. Decoding (and the "never crash on
    /// malformed input" guarantee) is the caller's job -- this is just
    /// the socket read.
    pub async fn recv_from(&self) -> TransportResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; UDP_DATAGRAM_MAX_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }
}
