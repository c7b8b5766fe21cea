//! Host ↔ enclave transport.
//!
//! Every connection carries exactly one logical message: a metadata frame
//! (`u32` big-endian length + JSON) followed by a raw payload that ends when
//! the sender shuts down its write side. See [`vaultbridge_core::wire`].

mod client;
mod receive;
mod request_buffer;
mod server;

pub use client::TransportClient;
pub use receive::{DecryptingReceiver, ResultChunkReceiver};
pub use request_buffer::{RequestBuffer, RequestBuffers};
pub use server::{ConnectionHandler, TransportServer};

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use vaultbridge_core::wire::{self, LENGTH_PREFIX_BYTES};
use vaultbridge_core::{Endpoint, MessageMetadata};

/// A bidirectional byte stream to the peer.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Open a connection to `endpoint`, bounded by `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<BoxConnection> {
    let conn: BoxConnection = match *endpoint {
        Endpoint::Tcp(addr) => {
            let stream = timed(timeout, "connect", TcpStream::connect(addr)).await?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        #[cfg(target_os = "linux")]
        Endpoint::Vsock { cid, port } => {
            use tokio_vsock::{VsockAddr, VsockStream};
            let stream = timed(
                timeout,
                "connect",
                VsockStream::connect(VsockAddr::new(cid, port)),
            )
            .await?;
            Box::new(stream)
        }
        #[cfg(not(target_os = "linux"))]
        Endpoint::Vsock { .. } => {
            anyhow::bail!("vsock is only supported on Linux")
        }
    };
    Ok(conn)
}

/// A bound server socket.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match *endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind {endpoint}"))?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(target_os = "linux")]
            Endpoint::Vsock { cid, port } => {
                let listener = tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(cid, port))
                    .with_context(|| format!("failed to bind {endpoint}"))?;
                Ok(Listener::Vsock(listener))
            }
            #[cfg(not(target_os = "linux"))]
            Endpoint::Vsock { .. } => anyhow::bail!("vsock is only supported on Linux"),
        }
    }

    /// Accept one connection. Returns it with a printable peer address.
    pub async fn accept(&mut self) -> io::Result<(BoxConnection, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(target_os = "linux")]
            Listener::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), format!("vsock://{}:{}", peer.cid(), peer.port())))
            }
        }
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(Endpoint::Tcp),
            #[cfg(target_os = "linux")]
            Listener::Vsock(listener) => listener.local_addr().map(|addr| Endpoint::Vsock {
                cid: addr.cid(),
                port: addr.port(),
            }),
        }
    }
}

/// Run `fut`, failing with `TimedOut` if it takes longer than `timeout`.
pub(crate) async fn timed<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))?
}

pub(crate) async fn write_frame<W>(writer: &mut W, metadata: &MessageMetadata) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = wire::encode_frame(metadata)?;
    writer.write_all(&frame).await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<MessageMetadata>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    reader
        .read_exact(&mut prefix)
        .await
        .context("reading frame length")?;
    let len = wire::frame_length(prefix, max_frame_bytes)?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("reading frame body")?;
    Ok(wire::decode_metadata(&body)?)
}

/// Read up to `chunk_size` bytes. Returns fewer only at end of stream,
/// and an empty buffer once the stream is exhausted.
pub(crate) async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = Vec::with_capacity(chunk_size);
    (&mut *reader)
        .take(chunk_size as u64)
        .read_to_end(&mut chunk)
        .await?;
    Ok(chunk)
}
