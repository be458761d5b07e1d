use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A client connection read in exact, known-size chunks.
///
/// SOCKS5 messages arrive in a fixed order, so fields are read straight off
/// the stream with no look-ahead buffer. Nothing is ever left unconsumed,
/// which lets the raw stream be handed to the relay via [`Connection::into_inner`].
pub struct Connection<S = TcpStream> {
    stream: S,
    peer: SocketAddr,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Connection { stream, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        let [byte] = self.read_array::<1>().await?;
        Ok(byte)
    }

    /// Fails with `UnexpectedEof` if the peer closes before `N` bytes arrive.
    pub async fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// One length byte followed by that many bytes of data.
    pub async fn read_length_prefixed(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u8().await? as usize;
        self.read_exact_bytes(len).await
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
