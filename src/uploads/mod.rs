//! Chunked multipart uploads with live progress reporting.
//!
//! An upload reads the inbound stream in fixed size chunks, pushes each
//! chunk to the object store as the next numbered part, and after every part
//! emits a progress snapshot to the session's progress channel, if one is
//! attached. When the stream ends the parts are finalized in order. Any
//! failure aborts the multipart transfer so no partial object or orphaned
//! parts are left behind.

use std::{error::Error as StdError, sync::Arc, time::Instant};

use blob_store::{BlobStorage, MultipartTransfer, PartToken};
use bytes::Bytes;
use futures::Stream;
use metrics::{upload_stats, Increment, Timer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod channel;
pub mod chunk_reader;
pub mod progress;

use channel::{ProgressChannelRegistry, SessionClaim};
use chunk_reader::ChunkReader;
use progress::{ProgressEvent, ProgressMessage};

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] blob_store::Error),

    #[error("failed reading upload stream: {0}")]
    Source(#[source] Box<dyn StdError + Send + Sync>),

    #[error("upload session {0} is already in use")]
    SessionInUse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub key: String,
    pub size_bytes: u64,
    pub parts: u32,
}

/// Per upload accumulator threaded through the chunk loop.
struct UploadState {
    total_size: u64,
    bytes_transferred: u64,
    started_at: Option<Instant>,
    parts: Vec<PartToken>,
}

impl UploadState {
    fn new(total_size: u64) -> Self {
        Self {
            total_size,
            bytes_transferred: 0,
            started_at: None,
            parts: vec![],
        }
    }

    fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    fn mark_started(&mut self) {
        self.started_at.get_or_insert_with(Instant::now);
    }

    fn record_part(&mut self, token: PartToken, len: u64) {
        self.bytes_transferred += len;
        self.parts.push(token);
    }

    /// Settles on the size actually received once the stream is exhausted.
    /// Returns whether the declared size was missing or wrong.
    fn settle_total(&mut self) -> bool {
        let corrected = self.total_size != self.bytes_transferred;
        self.total_size = self.bytes_transferred;
        corrected
    }

    fn progress(&self, now: Instant) -> ProgressEvent {
        progress::compute(
            self.bytes_transferred,
            self.total_size,
            self.started_at.unwrap_or(now),
            now,
        )
    }
}

/// Aborts the multipart transfer unless disarmed. If the owning future is
/// dropped mid upload (client went away) the abort runs on a spawned task.
struct TransferGuard {
    blob_storage: Arc<BlobStorage>,
    transfer: Option<MultipartTransfer>,
}

impl TransferGuard {
    fn new(blob_storage: Arc<BlobStorage>, transfer: MultipartTransfer) -> Self {
        Self {
            blob_storage,
            transfer: Some(transfer),
        }
    }

    fn disarm(&mut self) {
        self.transfer = None;
    }

    async fn abort(mut self) {
        if let Some(transfer) = self.transfer.take() {
            let key = transfer.key.clone();
            if let Err(e) = self.blob_storage.abort_multipart(transfer).await {
                error!(key = %key, "failed to abort multipart transfer: {:?}", e);
            }
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %transfer.key, "no runtime to abort multipart transfer");
            return;
        };
        let blob_storage = self.blob_storage.clone();
        handle.spawn(async move {
            warn!(key = %transfer.key, "upload cancelled, aborting multipart transfer");
            let key = transfer.key.clone();
            if let Err(e) = blob_storage.abort_multipart(transfer).await {
                error!(key = %key, "failed to abort multipart transfer: {:?}", e);
            }
        });
    }
}

/// Keeps only the last path component of a client supplied filename.
pub fn display_name(filename: &str) -> &str {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() {
        "file"
    } else {
        name
    }
}

/// Unique storage key for a new upload of `filename`.
pub fn storage_key(filename: &str) -> String {
    format!("{}_{}", Uuid::new_v4(), display_name(filename))
}

pub struct Uploader {
    blob_storage: Arc<BlobStorage>,
    progress: Arc<ProgressChannelRegistry>,
    chunk_size: usize,
    metrics: upload_stats::Metrics,
}

impl Uploader {
    pub fn new(
        blob_storage: Arc<BlobStorage>,
        progress: Arc<ProgressChannelRegistry>,
        chunk_size: usize,
    ) -> Self {
        Self {
            blob_storage,
            progress,
            chunk_size,
            metrics: upload_stats::Metrics::new(),
        }
    }

    /// Uploads `stream` under a freshly generated storage key.
    pub async fn upload<S, E>(
        &self,
        stream: S,
        filename: &str,
        total_size: u64,
        session_id: Option<&str>,
    ) -> Result<UploadOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        let key = storage_key(filename);
        self.upload_to(&key, stream, total_size, session_id).await
    }

    /// Uploads `stream` under `key`, replacing any existing object once the
    /// transfer is finalized.
    #[tracing::instrument(skip(self, stream))]
    pub async fn upload_to<S, E>(
        &self,
        key: &str,
        stream: S,
        total_size: u64,
        session_id: Option<&str>,
    ) -> Result<UploadOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        let session = match session_id {
            Some(session_id) => Some(
                self.progress
                    .claim(session_id)
                    .ok_or_else(|| UploadError::SessionInUse(session_id.to_string()))?,
            ),
            None => None,
        };
        let _inc = Increment::inc(&self.metrics.uploads, &[]);
        let _timer = Timer::start(&self.metrics.upload_duration);

        let transfer = match self.blob_storage.create_multipart(key).await {
            Ok(transfer) => transfer,
            Err(e) => {
                let e = UploadError::from(e);
                self.fail_session(session, &e);
                return Err(e);
            }
        };
        let mut guard = TransferGuard::new(self.blob_storage.clone(), transfer.clone());
        let mut state = UploadState::new(total_size);

        let mut result = self
            .transfer_parts(&transfer, Box::pin(stream), &mut state, session.as_ref())
            .await;
        if result.is_ok() {
            result = self
                .blob_storage
                .complete_multipart(&transfer, state.parts.clone())
                .await
                .map(|_| ())
                .map_err(UploadError::from);
        }

        if let Err(e) = result {
            error!(key, parts = state.parts.len(), "upload failed: {}", e);
            guard.abort().await;
            self.fail_session(session, &e);
            return Err(e);
        }

        guard.disarm();
        info!(
            key,
            parts = state.parts.len(),
            size_bytes = state.bytes_transferred,
            "upload complete"
        );
        if let Some(session) = session {
            session.finish(ProgressMessage::complete());
        }
        Ok(UploadOutcome {
            key: key.to_string(),
            size_bytes: state.bytes_transferred,
            parts: state.parts.len() as u32,
        })
    }

    fn fail_session(&self, session: Option<SessionClaim>, e: &UploadError) {
        self.metrics.upload_failures.add(1, &[]);
        if let Some(session) = session {
            session.finish(ProgressMessage::failed(e));
        }
    }

    async fn transfer_parts<S, E>(
        &self,
        transfer: &MultipartTransfer,
        stream: S,
        state: &mut UploadState,
        session: Option<&SessionClaim>,
    ) -> Result<(), UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut reader = ChunkReader::new(stream, self.chunk_size);
        while let Some(chunk) = reader
            .next_chunk()
            .await
            .map_err(|e| UploadError::Source(e.into()))?
        {
            state.mark_started();
            self.upload_part(transfer, chunk, state, session).await?;
        }
        if state.parts.is_empty() {
            // finalizing requires at least one part, even for an empty file
            state.mark_started();
            self.upload_part(transfer, Bytes::new(), state, session)
                .await?;
        }
        if state.settle_total() && state.bytes_transferred > 0 {
            debug!(
                size_bytes = state.bytes_transferred,
                "declared upload size did not match the stream"
            );
            self.report_progress(state, session);
        }
        Ok(())
    }

    async fn upload_part(
        &self,
        transfer: &MultipartTransfer,
        chunk: Bytes,
        state: &mut UploadState,
        session: Option<&SessionClaim>,
    ) -> Result<(), UploadError> {
        let part_number = state.next_part_number();
        let len = chunk.len() as u64;
        let token = self
            .blob_storage
            .put_part(transfer, part_number, chunk)
            .await?;
        state.record_part(token, len);
        self.metrics.parts.add(1, &[]);
        self.metrics.upload_bytes.add(len, &[]);
        debug!(part_number, len, "uploaded part");
        self.report_progress(state, session);
        Ok(())
    }

    fn report_progress(&self, state: &UploadState, session: Option<&SessionClaim>) {
        let Some(session) = session else {
            return;
        };
        let event = state.progress(Instant::now());
        if !session.send(ProgressMessage::Progress(event)) {
            self.metrics.progress_events_dropped.add(1, &[]);
        }
    }
}
