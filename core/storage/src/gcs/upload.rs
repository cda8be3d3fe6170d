//! Streaming object upload.

use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tracing::debug;

use stashbox_common::{Error, Result};

use super::client::{ChunkStatus, GcsClient, StoredObject, CHUNK_SIZE, SIMPLE_UPLOAD_LIMIT};

/// Most bytes buffered once a resumable session is open.
pub const SESSION_BUFFER_LIMIT: usize = 2 * CHUNK_SIZE;

type StepFuture = Pin<Box<dyn Future<Output = Result<Step>> + Send>>;

enum Step {
    Started(String),
    Chunk(ChunkStatus),
}

/// Writer that uploads an object as it is written.
///
/// Objects up to [`SIMPLE_UPLOAD_LIMIT`] are buffered and sent in a single
/// request by [`UploadWriter::finish`]. Past that, a resumable session is
/// opened and full chunks are sent from `poll_write`, so at most
/// [`SESSION_BUFFER_LIMIT`] bytes stay buffered. The last chunk, which
/// carries the total size, is sent by `finish`.
pub struct UploadWriter {
    client: Arc<GcsClient>,
    bucket: String,
    name: String,
    buffer: BytesMut,
    session: Option<String>,
    // Offset of `buffer[0]` in the object; everything before is persisted.
    offset: u64,
    pending: Option<StepFuture>,
}

impl UploadWriter {
    /// Create a writer for `bucket/name`. Nothing is sent until data arrives.
    pub fn new(client: Arc<GcsClient>, bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            name: name.into(),
            buffer: BytesMut::new(),
            session: None,
            offset: 0,
            pending: None,
        }
    }

    /// Bytes held in memory, not yet persisted.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a resumable session is open.
    pub fn is_resumable(&self) -> bool {
        self.session.is_some()
    }

    /// Send the remaining data and complete the object.
    ///
    /// # Errors
    /// - Network, authentication and API errors of the upload
    pub async fn finish(mut self) -> Result<StoredObject> {
        if let Some(pending) = self.pending.take() {
            let step = pending.await;
            self.apply(step)?;
        }

        let Some(uri) = self.session.clone() else {
            let data = self.buffer.split().freeze();
            return self.client.upload_simple(&self.bucket, &self.name, data).await;
        };

        let total = self.offset + self.buffer.len() as u64;
        loop {
            if self.buffer.is_empty() {
                return Err(Error::Network(format!(
                    "Upload session for gs://{}/{} did not complete",
                    self.bucket, self.name
                )));
            }
            let chunk = Bytes::copy_from_slice(&self.buffer);
            match self
                .client
                .upload_chunk(&uri, chunk, self.offset, Some(total))
                .await?
            {
                ChunkStatus::Complete(stored) => return Ok(stored),
                ChunkStatus::Incomplete { persisted } => self.advance(persisted)?,
            }
        }
    }

    fn apply(&mut self, step: Result<Step>) -> Result<()> {
        match step? {
            Step::Started(uri) => {
                debug!(bucket = %self.bucket, object = %self.name, "Started resumable upload");
                self.session = Some(uri);
                Ok(())
            }
            Step::Chunk(ChunkStatus::Incomplete { persisted }) => self.advance(persisted),
            Step::Chunk(ChunkStatus::Complete(_)) => Err(Error::Network(format!(
                "Upload of gs://{}/{} completed before its final chunk",
                self.bucket, self.name
            ))),
        }
    }

    /// Drop the bytes the server reports as persisted.
    fn advance(&mut self, persisted: u64) -> Result<()> {
        let stored = persisted
            .checked_sub(self.offset)
            .filter(|n| *n > 0 && *n as usize <= self.buffer.len())
            .ok_or_else(|| {
                Error::Network(format!(
                    "Upload made no progress: server persisted {} bytes, {} already sent",
                    persisted, self.offset
                ))
            })?;

        self.buffer.advance(stored as usize);
        self.offset = persisted;
        Ok(())
    }

    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let step = ready!(pending.as_mut().poll(cx));
        self.pending = None;
        Poll::Ready(self.apply(step))
    }

    fn start_session(&mut self) {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let name = self.name.clone();
        self.pending = Some(Box::pin(async move {
            client
                .start_resumable_upload(&bucket, &name)
                .await
                .map(Step::Started)
        }));
    }

    fn send_chunk(&mut self, uri: String) {
        let client = self.client.clone();
        let chunk = Bytes::copy_from_slice(&self.buffer[..CHUNK_SIZE]);
        let start = self.offset;
        self.pending = Some(Box::pin(async move {
            client
                .upload_chunk(&uri, chunk, start, None)
                .await
                .map(Step::Chunk)
        }));
    }
}

impl AsyncWrite for UploadWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            ready!(this.poll_pending(cx)).map_err(io::Error::other)?;

            let Some(uri) = this.session.clone() else {
                if this.buffer.len() + buf.len() <= SIMPLE_UPLOAD_LIMIT {
                    this.buffer.extend_from_slice(buf);
                    return Poll::Ready(Ok(buf.len()));
                }
                this.start_session();
                continue;
            };

            // Keep at least one byte back for the final chunk.
            if this.buffer.len() > CHUNK_SIZE {
                this.send_chunk(uri);
                continue;
            }

            let accepted = buf.len().min(SESSION_BUFFER_LIMIT - this.buffer.len());
            this.buffer.extend_from_slice(&buf[..accepted]);
            return Poll::Ready(Ok(accepted));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending(cx).map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
