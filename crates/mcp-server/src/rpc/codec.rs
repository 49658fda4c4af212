//! Newline-delimited JSON-RPC framing over the backend's stdio pipes.

use crate::error::BridgeError;
use sonar_mcp_protocol::backend::{FrameError, RpcFrame};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

pub(crate) const MAX_FRAME_BYTES: usize = if cfg!(test) { 64 * 1024 } else { 16 * 1024 * 1024 };

const WRITE_QUEUE_DEPTH: usize = 64;

pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R) -> Self {
        Self {
            inner: BufReader::new(read),
            buf: Vec::new(),
        }
    }

    /// Next frame, `Ok(None)` on EOF. Malformed or oversized lines surface as
    /// `Some(Err(_))` and leave the reader positioned at the next line.
    pub async fn next_frame(&mut self) -> io::Result<Option<Result<RpcFrame, FrameError>>> {
        loop {
            self.buf.clear();
            let limit = (MAX_FRAME_BYTES + 1) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                return Ok(None);
            }

            if self.buf.last() != Some(&b'\n') && self.buf.len() > MAX_FRAME_BYTES {
                self.discard_rest_of_line().await?;
                return Ok(Some(Err(FrameError::Invalid(format!(
                    "frame exceeds maximum size of {MAX_FRAME_BYTES} bytes"
                )))));
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(RpcFrame::parse(&self.buf)));
        }
    }

    async fn discard_rest_of_line(&mut self) -> io::Result<()> {
        let mut scratch = Vec::new();
        loop {
            scratch.clear();
            let read = (&mut self.inner)
                .take(MAX_FRAME_BYTES as u64)
                .read_until(b'\n', &mut scratch)
                .await?;
            if read == 0 || scratch.last() == Some(&b'\n') {
                return Ok(());
            }
        }
    }
}

struct WriteRequest {
    bytes: Vec<u8>,
    reply: oneshot::Sender<io::Result<()>>,
}

/// Serializes writes from concurrent callers onto one pipe.
#[derive(Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl FrameWriter {
    pub fn spawn<W>(write: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        tokio::spawn(run_write_loop(write, rx));
        Self { tx }
    }

    pub async fn send(&self, frame: &RpcFrame) -> Result<(), BridgeError> {
        let bytes = frame
            .to_line()
            .map_err(|err| BridgeError::Protocol(format!("encode frame: {err}")))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::unavailable("backend channel closed"))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BridgeError::unavailable(format!(
                "write to backend failed: {err}"
            ))),
            Err(_) => Err(BridgeError::unavailable("backend channel closed")),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_write_loop<W: AsyncWrite + Unpin>(mut write: W, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(req) = rx.recv().await {
        let result = async {
            write.write_all(&req.bytes).await?;
            write.flush().await?;
            Ok(())
        }
        .await;
        let should_stop = result.is_err();
        let _ = req.reply.send(result);
        if should_stop {
            break;
        }
    }
    let _ = write.shutdown().await;
}
