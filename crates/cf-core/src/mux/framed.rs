//! Conduit over a plain byte stream, used for direct node connections

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::ConduitError;
use crate::traits::Conduit;

/// Length-prefixed message pipe over any async byte stream
pub struct FramedConduit<S> {
    inner: Framed<S, LengthDelimitedCodec>,
    peer: String,
    closed: bool,
}

impl<S> FramedConduit<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S, peer: impl Into<String>) -> Self {
        Self {
            inner: Framed::new(io, LengthDelimitedCodec::new()),
            peer: peer.into(),
            closed: false,
        }
    }
}

impl FramedConduit<TcpStream> {
    /// Dial `addr` directly
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ConduitError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, addr))
    }
}

#[async_trait]
impl<S> Conduit for FramedConduit<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: Bytes) -> Result<(), ConduitError> {
        if self.closed {
            return Err(ConduitError::Closed);
        }
        self.inner.send(payload).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, ConduitError> {
        if self.closed {
            return Ok(None);
        }
        match self.inner.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = SinkExt::<Bytes>::close(&mut self.inner).await {
                debug!(peer = %self.peer, "Close failed: {}", e);
            }
        }
    }

    fn describe(&self) -> String {
        format!("direct {}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = FramedConduit::new(a, "left");
        let mut right = FramedConduit::new(b, "right");

        left.send(Bytes::from_static(b"one")).await.unwrap();
        left.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(right.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(right.recv().await.unwrap().unwrap(), Bytes::from_static(b"two"));

        left.close().await;
        assert!(right.recv().await.unwrap().is_none());
        assert!(matches!(left.send(Bytes::new()).await, Err(ConduitError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(FramedConduit::connect(&addr, Duration::from_secs(1)).await.is_err());
    }
}
