//! Seams towards the stream multiplexer which carves a single data channel into many logical
//! streams.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::stream::DataStream;

/// One logical stream of a multiplexed connection.
#[async_trait]
pub trait MuxedStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Abruptly tears the stream down in both directions.
    async fn reset(&mut self) -> Result<(), Error>;
}

#[async_trait]
pub trait MuxedConn: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, Error>;

    async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, Error>;

    async fn close(&self) -> Result<(), Error>;

    fn is_closed(&self) -> bool;
}

/// Builds multiplexed connections over data streams.
pub trait Multiplexer: Send + Sync {
    /// Wraps `stream`. `is_server` tells which side of the connection this is, multiplexers
    /// use it to pick non-conflicting stream identifiers.
    fn new_conn(&self, stream: DataStream, is_server: bool) -> Result<Arc<dyn MuxedConn>, Error>;
}

/// Multiplexer which does not multiplex: the connection carries exactly one stream, the data
/// stream itself. The first stream opened or accepted takes it, every later one fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMultiplexer;

impl Multiplexer for DirectMultiplexer {
    fn new_conn(&self, stream: DataStream, is_server: bool) -> Result<Arc<dyn MuxedConn>, Error> {
        debug!("{}: Use data stream directly (server: {})", stream.id(), is_server);
        Ok(Arc::new(DirectConn {
            stream: Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        }))
    }
}

#[derive(Debug)]
struct DirectConn {
    stream: Mutex<Option<DataStream>>,
    closed: CancellationToken,
}

impl DirectConn {
    fn take(&self) -> Result<Box<dyn MuxedStream>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        match self.stream.lock().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(Error::Unsupported("more than one stream over a direct connection")),
        }
    }
}

#[async_trait]
impl MuxedConn for DirectConn {
    async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        self.take()
    }

    async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        self.take()
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.reset().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
