use std::future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::ReusableBoxFuture;

use crate::error::Error;
use crate::mux::MuxedStream;
use crate::rtc::RawChannel;

/// Largest message read from or written to a data channel at once.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Byte stream over a detached data channel.
///
/// Every read of the underlying channel yields exactly one message, which may be larger than
/// the caller's buffer. The message is stashed in an internal buffer and handed out over as many
/// reads as needed; the channel is not read again before the buffer is drained.
///
/// A write sends at most [MAX_MESSAGE_SIZE] bytes as a single message. Larger buffers are written
/// partially, callers have to loop (as `AsyncWriteExt::write_all` does).
///
/// Read errors of the channel surface as the end of the stream: this layer does not tell a
/// broken channel apart from a closed one.
pub struct DataStream {
    id: String,
    channel: Arc<dyn RawChannel>,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    reading: bool,
    reader: ReusableBoxFuture<'static, (Vec<u8>, Result<usize, Error>)>,
    writing: bool,
    writer: ReusableBoxFuture<'static, Result<usize, Error>>,
}

impl DataStream {
    pub fn new(channel: Arc<dyn RawChannel>) -> Self {
        DataStream {
            id: crate::random_id("stream"),
            channel,
            buffer: vec![0; MAX_MESSAGE_SIZE],
            start: 0,
            end: 0,
            eof: false,
            reading: false,
            reader: ReusableBoxFuture::new(future::ready((Vec::new(), Ok(0)))),
            writing: false,
            writer: ReusableBoxFuture::new(future::ready(Ok(0))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Closes the underlying channel.
    pub async fn reset(&mut self) -> Result<(), Error> {
        debug!("{}: Reset stream", self.id);
        self.eof = true;
        self.channel.close().await
    }

    /// Deadlines are not supported, the call is accepted and ignored.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), Error> {
        Ok(())
    }

    /// Deadlines are not supported, the call is accepted and ignored.
    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), Error> {
        Ok(())
    }

    /// Deadlines are not supported, the call is accepted and ignored.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), Error> {
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.buffered().min(buf.remaining());
        buf.put_slice(&self.buffer[self.start..self.start + n]);
        self.start += n;
        if self.start >= self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        while this.buffered() == 0 && !this.eof {
            if !this.reading {
                let mut message = std::mem::take(&mut this.buffer);
                let channel = this.channel.clone();
                this.reader.set(async move {
                    let res = channel.read(&mut message).await;
                    (message, res)
                });
                this.reading = true;
            }

            let (message, res) = ready!(this.reader.poll(cx));
            this.reading = false;
            this.buffer = message;
            match res {
                // empty message, not the end of the stream
                Ok(0) => continue,
                Ok(n) => this.end = n,
                Err(e) => {
                    debug!("{}: Error occurred while reading from data channel: {}", this.id, e);
                    this.eof = true;
                }
            }
        }

        this.drain_into(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if buf.is_empty() && !this.writing {
            return Poll::Ready(Ok(0));
        }
        if !this.writing {
            let chunk = Bytes::copy_from_slice(&buf[..buf.len().min(MAX_MESSAGE_SIZE)]);
            let channel = this.channel.clone();
            this.writer.set(async move { channel.write(chunk).await });
            this.writing = true;
        }

        let res = ready!(this.writer.poll(cx));
        this.writing = false;
        Poll::Ready(res.map_err(io::Error::from))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.writing {
            let res = ready!(self.writer.poll(cx));
            self.writing = false;
            res.map_err(io::Error::from)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the channel belongs to the connection, it's closed together with it
        warn!("{}: Close stream (no actions)", self.id);
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl MuxedStream for DataStream {
    async fn reset(&mut self) -> Result<(), Error> {
        DataStream::reset(self).await
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("id", &self.id)
            .field("buffered", &self.buffered())
            .field("eof", &self.eof)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::memory_channel_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn message_is_read_in_caller_sized_chunks() {
        let (a, b) = memory_channel_pair();
        let mut writer = DataStream::new(a);
        let mut reader = DataStream::new(b);

        let payload: Vec<u8> = (0..100u8).collect();
        writer.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        for size in [1usize, 7, 13, 29, 50] {
            let mut chunk = vec![0u8; size];
            let n = reader.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn buffered_data_is_drained_before_the_next_message() {
        let (a, b) = memory_channel_pair();
        let mut writer = DataStream::new(a);
        let mut reader = DataStream::new(b);

        writer.write_all(b"first").await.unwrap();
        writer.write_all(b"second").await.unwrap();

        let mut buf = [0u8; 3];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"fir");
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"st");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[tokio::test]
    async fn oversized_write_is_partial() {
        let (a, b) = memory_channel_pair();
        let mut writer = DataStream::new(a);
        let mut reader = DataStream::new(b);

        let payload = vec![7u8; MAX_MESSAGE_SIZE + 10];
        let n = writer.write(&payload).await.unwrap();
        assert_eq!(n, MAX_MESSAGE_SIZE);

        let mut received = vec![0u8; MAX_MESSAGE_SIZE];
        reader.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn read_error_is_end_of_stream() {
        let (a, b) = memory_channel_pair();
        let mut reader = DataStream::new(b);
        a.close().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_closes_channel() {
        let (a, b) = memory_channel_pair();
        let mut local = DataStream::new(a);
        let mut remote = DataStream::new(b);

        local.reset().await.unwrap();
        assert!(local.write_all(b"x").await.is_err());

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_and_deadlines_are_no_ops() {
        let (a, b) = memory_channel_pair();
        let mut writer = DataStream::new(a);
        let mut reader = DataStream::new(b);

        writer.set_deadline(Some(Instant::now())).unwrap();
        writer.set_write_deadline(None).unwrap();
        reader.set_read_deadline(Some(Instant::now())).unwrap();
        writer.shutdown().await.unwrap();

        // the channel stays usable after shutdown
        writer.write_all(b"still open").await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still open");
    }

    #[tokio::test]
    async fn empty_write_sends_nothing() {
        let (a, b) = memory_channel_pair();
        let mut writer = DataStream::new(a);
        let mut reader = DataStream::new(b);

        assert_eq!(writer.write(&[]).await.unwrap(), 0);
        writer.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn empty_message_does_not_end_the_stream() {
        let (a, b) = memory_channel_pair();
        let mut reader = DataStream::new(b);

        a.write(Bytes::new()).await.unwrap();
        a.write(Bytes::from_static(b"after")).await.unwrap();

        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }
}
