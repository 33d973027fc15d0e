//! Bounded in-memory byte pipe between shard tasks.
//!
//! One producer, one consumer. Writers block once the buffer is full, so
//! backpressure propagates through a flow without dropping or spilling.
//! Closing the writer delivers EOF to the reader after the buffered bytes
//! drain; once the reader is gone, writes fail with `BrokenPipe`.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream, WriteHalf};

/// Buffer sized for small-message throughput between local tasks.
pub const DEFAULT_PIPE_BUFFER: usize = 32 * 1024;

/// Creates a pipe with the given buffer capacity in bytes.
pub fn pipe(buffer: usize) -> (PipeReader, PipeWriter) {
    let (read, write) = tokio::io::simplex(buffer);
    (PipeReader { inner: read }, PipeWriter { inner: write })
}

/// The consuming end of a pipe.
#[derive(Debug)]
pub struct PipeReader {
    inner: ReadHalf<SimplexStream>,
}

/// The producing end of a pipe.
#[derive(Debug)]
pub struct PipeWriter {
    inner: WriteHalf<SimplexStream>,
}

impl PipeReader {
    /// Closes the reader. In-flight producers observe `BrokenPipe` on
    /// their next write and stop.
    pub fn close(self) {}
}

impl PipeWriter {
    /// Flushes and shuts the pipe down, delivering EOF to the reader once
    /// the buffer drains.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn writer_close_delivers_eof_after_drain() {
        let (mut r, mut w) = pipe(8);
        w.write_all(b"abcd").await.expect("write");
        w.close().await.expect("close");

        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.expect("read");
        assert_eq!(buf, b"abcd");
    }

    #[tokio::test]
    async fn write_after_reader_close_is_broken_pipe() {
        let (r, mut w) = pipe(8);
        r.close();

        let err = loop {
            match w.write_all(b"xxxxxxxx").await {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn full_buffer_blocks_the_writer() {
        let (mut r, mut w) = pipe(4);
        w.write_all(b"1234").await.expect("fill");

        // A fifth byte cannot complete until the reader consumes.
        let blocked = tokio::time::timeout(Duration::from_millis(50), w.write_all(b"5")).await;
        assert!(blocked.is_err(), "write should block on a full buffer");

        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.expect("drain");
        tokio::time::timeout(Duration::from_millis(200), w.write_all(b"5"))
            .await
            .expect("write resumes after drain")
            .expect("write");
    }

    #[tokio::test]
    async fn producer_never_outruns_buffer_plus_consumed() {
        let (mut r, mut w) = pipe(16);
        let writer = tokio::spawn(async move {
            let mut written = 0usize;
            for _ in 0..64 {
                w.write_all(&[7u8; 8]).await.expect("write");
                written += 8;
            }
            w.close().await.expect("close");
            written
        });

        let mut consumed = 0usize;
        let mut buf = [0u8; 8];
        loop {
            // Slow reader: one chunk at a time.
            tokio::time::sleep(Duration::from_millis(1)).await;
            match r.read(&mut buf).await.expect("read") {
                0 => break,
                n => consumed += n,
            }
        }
        assert_eq!(consumed, writer.await.expect("join"));
    }
}
