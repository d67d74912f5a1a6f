//! Flow links: chunk streams, in-process pipes, and adapters
//!
//! A [`Link`] is a bidirectional pair of chunk-stream endpoints representing
//! one logical flow between an inbound session and an outbound destination.
//! Chunks carry an optional endpoint so UDP relays can tag each datagram
//! with its source or destination.
//!
//! The pipe pair built by [`pipe`] backs chained dispatch: the caller keeps
//! one end as a duplex byte-stream connection ([`PipeConnection`]) while the
//! nested handler drives the other end as a `Link`. Close and interrupt are
//! distinct: close is graceful EOF, interrupt aborts the peer.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::net::{Address, Destination};

/// Default chunk payload size for byte-stream adapters
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default pipe depth in chunks
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// One unit of flow data, optionally tagged with a UDP endpoint
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Payload bytes
    pub data: Bytes,
    /// Source/destination endpoint for multi-destination UDP sessions
    pub endpoint: Option<Destination>,
}

impl Chunk {
    /// Create an untagged chunk
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            endpoint: None,
        }
    }

    /// Create a chunk tagged with an endpoint
    #[must_use]
    pub fn with_endpoint(data: Bytes, endpoint: Destination) -> Self {
        Self {
            data,
            endpoint: Some(endpoint),
        }
    }
}

/// Reading side of a flow
#[async_trait]
pub trait ChunkReader: Send {
    /// Read the next chunk; `None` means clean EOF.
    async fn read_chunk(&mut self) -> io::Result<Option<Chunk>>;

    /// Forcibly terminate the stream; any blocked peer is woken.
    fn interrupt(&mut self) {}
}

/// Writing side of a flow
#[async_trait]
pub trait ChunkWriter: Send {
    /// Write one chunk.
    async fn write_chunk(&mut self, chunk: Chunk) -> io::Result<()>;

    /// Gracefully close the stream; the peer observes EOF.
    async fn close(&mut self) -> io::Result<()>;

    /// Forcibly terminate the stream; the peer observes an abort.
    fn interrupt(&mut self) {}
}

/// A bidirectional pair of chunk-stream endpoints for one flow.
///
/// The dispatch call that owns a link is responsible for terminating both
/// ends on every exit path.
pub struct Link {
    /// Flow data from the inbound session
    pub reader: Box<dyn ChunkReader>,
    /// Flow data back to the inbound session
    pub writer: Box<dyn ChunkWriter>,
}

impl Link {
    /// Build a link over a duplex byte stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Box::new(StreamChunkReader::new(r)),
            writer: Box::new(StreamChunkWriter::new(w)),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

// ============================================================================
// In-process pipe
// ============================================================================

#[derive(Debug, Default)]
struct PipeShared {
    interrupted: AtomicBool,
}

/// Writing end of a single-direction pipe
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Chunk>>,
    shared: Arc<PipeShared>,
}

/// Reading end of a single-direction pipe
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    shared: Arc<PipeShared>,
}

/// Create a single-direction chunk pipe of the given depth.
#[must_use]
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(PipeShared::default());
    (
        PipeReader {
            rx,
            shared: Arc::clone(&shared),
        },
        PipeWriter {
            tx: Some(tx),
            shared,
        },
    )
}

#[async_trait]
impl ChunkReader for PipeReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Chunk>> {
        match self.rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None if self.shared.interrupted.load(Ordering::Acquire) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "pipe interrupted",
            )),
            None => Ok(None),
        }
    }

    fn interrupt(&mut self) {
        self.shared.interrupted.store(true, Ordering::Release);
        // Wakes blocked senders; their sends fail with a closed channel.
        self.rx.close();
    }
}

#[async_trait]
impl ChunkWriter for PipeWriter {
    async fn write_chunk(&mut self, chunk: Chunk) -> io::Result<()> {
        if self.shared.interrupted.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe interrupted",
            ));
        }
        match &self.tx {
            Some(tx) => tx
                .send(chunk)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }

    fn interrupt(&mut self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.tx = None;
    }
}

impl PipeWriter {
    fn into_parts(mut self) -> (Option<mpsc::Sender<Chunk>>, Arc<PipeShared>) {
        (self.tx.take(), Arc::clone(&self.shared))
    }
}

// ============================================================================
// Byte-stream adapters
// ============================================================================

/// Adapts an `AsyncRead` into a `ChunkReader`
pub struct StreamChunkReader<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> StreamChunkReader<R> {
    /// Wrap a reader with the default chunk size
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> ChunkReader for StreamChunkReader<R> {
    async fn read_chunk(&mut self) -> io::Result<Option<Chunk>> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Chunk::new(Bytes::from(buf))))
    }
}

/// Adapts an `AsyncWrite` into a `ChunkWriter`
pub struct StreamChunkWriter<W> {
    writer: W,
}

impl<W> StreamChunkWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ChunkWriter for StreamChunkWriter<W> {
    async fn write_chunk(&mut self, chunk: Chunk) -> io::Result<()> {
        self.writer.write_all(&chunk.data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

// ============================================================================
// Endpoint-override adapters
// ============================================================================

/// Restores the pre-NAT destination on chunks read from the inbound side:
/// chunks tagged with the rewritten target are re-tagged with the original
/// destination so downstream protocol codecs see the pre-NAT address.
pub struct EndpointOverrideReader {
    inner: Box<dyn ChunkReader>,
    target: Address,
    original: Address,
}

impl EndpointOverrideReader {
    /// Wrap a reader with a target -> original address mapping
    pub fn new(inner: Box<dyn ChunkReader>, target: Address, original: Address) -> Self {
        Self {
            inner,
            target,
            original,
        }
    }
}

#[async_trait]
impl ChunkReader for EndpointOverrideReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Chunk>> {
        let mut chunk = self.inner.read_chunk().await?;
        if let Some(c) = chunk.as_mut() {
            if let Some(ep) = c.endpoint.as_mut() {
                if ep.address == self.target {
                    ep.address = self.original.clone();
                }
            }
        }
        Ok(chunk)
    }

    fn interrupt(&mut self) {
        self.inner.interrupt();
    }
}

/// Inverse of [`EndpointOverrideReader`]: chunks written toward the inbound
/// side tagged with the original destination are re-tagged with the
/// rewritten target.
pub struct EndpointOverrideWriter {
    inner: Box<dyn ChunkWriter>,
    target: Address,
    original: Address,
}

impl EndpointOverrideWriter {
    /// Wrap a writer with an original -> target address mapping
    pub fn new(inner: Box<dyn ChunkWriter>, target: Address, original: Address) -> Self {
        Self {
            inner,
            target,
            original,
        }
    }
}

#[async_trait]
impl ChunkWriter for EndpointOverrideWriter {
    async fn write_chunk(&mut self, mut chunk: Chunk) -> io::Result<()> {
        if let Some(ep) = chunk.endpoint.as_mut() {
            if ep.address == self.original {
                ep.address = self.target.clone();
            }
        }
        self.inner.write_chunk(chunk).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }

    fn interrupt(&mut self) {
        self.inner.interrupt();
    }
}

// ============================================================================
// Duplex connection over a pipe pair
// ============================================================================

/// A byte-stream connection built from the caller-side ends of a chained
/// dispatch pipe pair: writes feed the uplink pipe, reads drain the downlink
/// pipe. No state is shared between the two directions.
pub struct PipeConnection {
    uplink: PollSender<Chunk>,
    uplink_shared: Arc<PipeShared>,
    downlink: mpsc::Receiver<Chunk>,
    downlink_shared: Arc<PipeShared>,
    read_buf: Bytes,
}

impl PipeConnection {
    /// Assemble a duplex connection from the uplink writer and downlink
    /// reader of a pipe pair. An already-closed uplink yields a connection
    /// whose writes fail with a broken pipe.
    #[must_use]
    pub fn new(uplink: PipeWriter, downlink: PipeReader) -> Self {
        let (tx, uplink_shared) = uplink.into_parts();
        let tx = tx.unwrap_or_else(|| {
            let (tx, _) = mpsc::channel(1);
            tx
        });
        Self {
            uplink: PollSender::new(tx),
            uplink_shared,
            downlink: downlink.rx,
            downlink_shared: downlink.shared,
            read_buf: Bytes::new(),
        }
    }
}

impl AsyncRead for PipeConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buf.is_empty() {
            match self.downlink.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buf = chunk.data,
                Poll::Ready(None) => {
                    if self.downlink_shared.interrupted.load(Ordering::Acquire) {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "pipe interrupted",
                        )));
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.read_buf.len().min(buf.remaining());
        buf.put_slice(&self.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PipeConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.uplink_shared.interrupted.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe interrupted",
            )));
        }
        match self.uplink.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Chunk::new(Bytes::copy_from_slice(buf));
                if self.uplink.send_item(chunk).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe closed",
                    )));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.uplink.close();
        Poll::Ready(Ok(()))
    }
}
