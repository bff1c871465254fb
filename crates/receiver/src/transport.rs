//! Transport implementations for sources (§6): a `Transport` abstracts over
//! TCP and UDP framing so `LogSource` only has to deal with byte chunks,
//! regardless of whether the connection is a stream or a datagram socket.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};

use crate::effect::EffectHandler;
use crate::Error;

/// A chunk of bytes read off a transport, paired with where it came from.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The peer this chunk arrived from.
    pub peer: SocketAddr,
    /// The bytes read. For TCP this is whatever the kernel handed back
    /// from one `read()`; for UDP it is exactly one datagram.
    pub bytes: Vec<u8>,
}

/// Abstracts over the two transports a `LogSource` can be bound to.
#[async_trait]
pub trait Transport: Send {
    /// Reads the next chunk of bytes, blocking until one is available or
    /// the transport is closed (`Ok(None)`).
    async fn recv(&mut self) -> Result<Option<Chunk>, Error>;
}

/// One accepted TCP connection, read until EOF.
pub struct TcpConnectionTransport {
    peer: SocketAddr,
    stream: tokio::net::TcpStream,
}

impl TcpConnectionTransport {
    /// Wraps an already-accepted connection.
    pub fn new(peer: SocketAddr, stream: tokio::net::TcpStream) -> Self {
        Self { peer, stream }
    }
}

#[async_trait]
impl Transport for TcpConnectionTransport {
    async fn recv(&mut self) -> Result<Option<Chunk>, Error> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::Receiver {
                receiver: "tcp".into(),
                error: e.to_string(),
                context: Default::default(),
            })?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Chunk { peer: self.peer, bytes: buf }))
    }
}

/// A TCP listener that hands off each accepted connection as a
/// `TcpConnectionTransport`. Bound through `EffectHandler` so the
/// multi-threaded and thread-per-core engines can choose whether the
/// listening socket is `SO_REUSEPORT`.
pub struct TcpListenerTransport {
    listener: TcpListener,
}

impl TcpListenerTransport {
    /// Binds a listener at `addr` through the engine's effect handler.
    pub async fn bind<Msg: 'static + Clone + Send>(
        addr: SocketAddr,
        effect_handler: &EffectHandler<Msg>,
    ) -> Result<Self, Error> {
        let listener = effect_handler.tokio_tcp_listener(addr).await?;
        Ok(Self { listener })
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> Result<TcpConnectionTransport, Error> {
        let (stream, peer) = self.listener.accept().await.map_err(|e| Error::TcpListener {
            receiver: "tcp".into(),
            error: e.to_string(),
        })?;
        Ok(TcpConnectionTransport::new(peer, stream))
    }
}

/// A bound UDP socket, one datagram per `recv`.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a UDP socket at `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| Error::TcpListener {
            receiver: "udp".into(),
            error: e.to_string(),
        })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&mut self) -> Result<Option<Chunk>, Error> {
        let mut buf = vec![0u8; 64 * 1024];
        let (n, peer) = self.socket.recv_from(&mut buf).await.map_err(|e| Error::Receiver {
            receiver: "udp".into(),
            error: e.to_string(),
            context: Default::default(),
        })?;
        buf.truncate(n);
        Ok(Some(Chunk { peer, bytes: buf }))
    }
}
