use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A connection to one cluster node.
///
/// Implementations carry at most one request at a time: `send` writes a frame
/// and waits for the matching reply. Error replies are returned as
/// `Ok(Frame::Error(..))`; only transport failures are `Err`.
#[async_trait]
pub trait NodeConnection: Send {
    /// Sends a request frame and waits for its reply.
    async fn send(&mut self, frame: &Frame) -> Result<Frame>;

    /// Closes the connection. Further use is undefined.
    async fn close(&mut self) {}
}

/// Opens node connections for the pool and for topology queries.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `address` (`host:port`).
    async fn connect(&self, address: &str) -> Result<Box<dyn NodeConnection>>;
}

/// A framed connection over any async byte stream.
///
/// # Example
///
/// ```ignore
/// use slotwise::core::connection::{Connection, NodeConnection};
/// use slotwise::proto::frame::Frame;
/// use tokio::net::TcpStream;
///
/// let stream = TcpStream::connect("127.0.0.1:7000").await?;
/// let mut conn = Connection::new(stream);
/// let reply = conn.send(&Frame::Array(vec![Frame::bulk("PING")])).await?;
/// ```
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection with the given stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Writes a frame to the connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one complete frame, waiting for more input as needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the peer closes the connection, or a protocol
    /// error if the input is malformed.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::connection_closed());
            }
            self.decoder.append(&buf[..n]);
        }
    }
}

impl<S> fmt::Debug for Connection<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .finish()
    }
}

#[async_trait]
impl<S> NodeConnection for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &Frame) -> Result<Frame> {
        trace!(?frame, "sending frame");
        self.write_frame(frame).await?;
        let reply = self.read_frame().await?;
        trace!(?reply, "received frame");
        Ok(reply)
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Default connector: plain TCP with an optional connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Creates a connector that gives up dialing after `connect_timeout`.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn NodeConnection>> {
        let dial = TcpStream::connect(address);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| Error::Connect {
                    address: address.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                })?,
            None => dial.await,
        }
        .map_err(|source| Error::Connect {
            address: address.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(Connection::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connection_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let frame = conn.read_frame().await.unwrap();
            assert_eq!(frame, Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("{key}1")]));
            conn.write_frame(&Frame::error("MOVED 2148 127.0.0.1:7001"))
                .await
                .unwrap();
        });

        let connector = TcpConnector::new(Some(Duration::from_secs(1)));
        let mut conn = connector.connect(&addr.to_string()).await.unwrap();
        let reply = conn
            .send(&Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("{key}1")]))
            .await
            .unwrap();
        assert_eq!(reply, Frame::error("MOVED 2148 127.0.0.1:7001"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_after_peer_close_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = TcpConnector::default()
            .connect(&addr.to_string())
            .await
            .unwrap();
        let err = conn
            .send(&Frame::Array(vec![Frame::bulk("PING")]))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector::default().connect(&addr.to_string()).await;
        assert!(matches!(result, Err(Error::Connect { .. })));
    }
}
