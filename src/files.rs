use std::{error::Error as StdError, sync::Arc};

use blob_store::{BlobStorage, BlobStream};
use bytes::Bytes;
use futures::Stream;
use metadata_store::{FileMetadata, MetadataStore};
use tracing::{error, info, warn};

use crate::{
    notifications::UploadNotifier,
    uploads::{display_name, UploadError, UploadOutcome, Uploader},
    utils::get_epoch_time_in_ms,
};

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Store(blob_store::Error),

    #[error(transparent)]
    Metadata(#[from] metadata_store::Error),
}

impl From<blob_store::Error> for FileError {
    fn from(e: blob_store::Error) -> Self {
        match e {
            blob_store::Error::NotFound { key } => Self::NotFound(key),
            e => Self::Store(e),
        }
    }
}

/// Uploads, downloads and bookkeeping for stored files.
pub struct FileService {
    blob_storage: Arc<BlobStorage>,
    metadata: Arc<MetadataStore>,
    uploader: Uploader,
    notifier: Arc<dyn UploadNotifier>,
}

impl FileService {
    pub fn new(
        blob_storage: Arc<BlobStorage>,
        metadata: Arc<MetadataStore>,
        uploader: Uploader,
        notifier: Arc<dyn UploadNotifier>,
    ) -> Self {
        Self {
            blob_storage,
            metadata,
            uploader,
            notifier,
        }
    }

    /// Uploads a file and records who uploaded it.
    pub async fn upload<S, E>(
        &self,
        stream: S,
        filename: &str,
        email: &str,
        total_size: u64,
        session_id: Option<&str>,
    ) -> Result<FileMetadata, FileError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        let outcome = self.store(stream, filename, total_size, session_id).await?;
        self.register(&outcome, filename, email).await
    }

    /// Stores the file contents only. The upload stays unregistered until
    /// [`Self::register`] records its metadata, or is removed with
    /// [`Self::discard`].
    pub async fn store<S, E>(
        &self,
        stream: S,
        filename: &str,
        total_size: u64,
        session_id: Option<&str>,
    ) -> Result<UploadOutcome, FileError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        Ok(self
            .uploader
            .upload(stream, filename, total_size, session_id)
            .await?)
    }

    /// Records metadata for a stored upload and notifies the uploader. The
    /// stored object is deleted if the metadata cannot be written.
    #[tracing::instrument(skip(self, outcome), fields(key = %outcome.key))]
    pub async fn register(
        &self,
        outcome: &UploadOutcome,
        filename: &str,
        email: &str,
    ) -> Result<FileMetadata, FileError> {
        let record = FileMetadata {
            s3_key: outcome.key.clone(),
            filename: display_name(filename).to_string(),
            email: email.to_string(),
            uploaded_at: get_epoch_time_in_ms(),
        };
        if let Err(e) = self.metadata.put(&record).await {
            error!("failed to record upload metadata, removing object: {}", e);
            self.discard(&outcome.key).await;
            return Err(e.into());
        }

        if let Err(e) = self.notifier.upload_completed(&record).await {
            warn!("failed to send upload notification: {:?}", e);
        }
        info!(size_bytes = outcome.size_bytes, "file uploaded");
        Ok(record)
    }

    /// Removes a stored object that will never be registered.
    pub async fn discard(&self, key: &str) {
        if let Err(e) = self.blob_storage.delete(key).await {
            warn!(key, "failed to discard stored object: {:?}", e);
        }
    }

    pub async fn fetch(&self, key: &str) -> Result<BlobStream, FileError> {
        Ok(self.blob_storage.get(key).await?)
    }

    pub async fn metadata(&self, key: &str) -> Result<FileMetadata, FileError> {
        self.metadata
            .get(key)
            .await?
            .ok_or_else(|| FileError::NotFound(key.to_string()))
    }

    /// Replaces the contents stored under an existing key. The recorded
    /// filename is updated when `filename` is given.
    #[tracing::instrument(skip(self, stream))]
    pub async fn overwrite<S, E>(
        &self,
        key: &str,
        stream: S,
        filename: Option<&str>,
        total_size: u64,
        session_id: Option<&str>,
    ) -> Result<UploadOutcome, FileError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        if self.blob_storage.head(key).await?.is_none() {
            return Err(FileError::NotFound(key.to_string()));
        }
        let outcome = self
            .uploader
            .upload_to(key, stream, total_size, session_id)
            .await?;
        if let Some(filename) = filename {
            if self
                .metadata
                .update_filename(key, display_name(filename))
                .await?
                .is_none()
            {
                warn!(key, "overwrote a file with no metadata record");
            }
        }
        info!(size_bytes = outcome.size_bytes, "file overwritten");
        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), FileError> {
        self.blob_storage.delete(key).await?;
        self.metadata.delete(key).await?;
        info!("file deleted");
        Ok(())
    }
}
