use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use blob_store::{BlobStorage, BlobStorageConfig};
use object_store::{
    memory::InMemory,
    multipart::{MultipartStore, PartId},
    path::Path,
    MultipartId,
    PutPayload,
    PutResult,
};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{ServerConfig, UploadConfig},
    service::Service,
};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_upload_config(UploadConfig::default()).await
    }

    pub async fn with_upload_config(upload: UploadConfig) -> Result<Self> {
        init_test_tracing();

        let cfg = ServerConfig {
            blob_storage: BlobStorageConfig {
                path: "memory:///".to_string(),
                region: None,
            },
            metadata_path: "metadata".to_string(),
            upload,
            ..Default::default()
        };
        let srv = Service::new(cfg).await?;

        Ok(Self { service: srv })
    }
}

fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartCall {
    Create,
    PutPart { part_idx: usize, len: usize },
    Complete { parts: usize },
    Abort,
}

/// In-memory multipart store that records every call and can be told to
/// fail a given part.
#[derive(Debug)]
pub struct RecordingMultipart {
    inner: Arc<InMemory>,
    calls: Mutex<Vec<MultipartCall>>,
    /// 1-based part number whose upload fails.
    fail_on_part: Option<u32>,
}

impl RecordingMultipart {
    pub fn new(inner: Arc<InMemory>) -> Self {
        Self {
            inner,
            calls: Mutex::new(vec![]),
            fail_on_part: None,
        }
    }

    pub fn failing_on_part(inner: Arc<InMemory>, part_number: u32) -> Self {
        Self {
            fail_on_part: Some(part_number),
            ..Self::new(inner)
        }
    }

    pub fn calls(&self) -> Vec<MultipartCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn part_numbers(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MultipartCall::PutPart { part_idx, .. } => Some(part_idx as u32 + 1),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, expected: &MultipartCall) -> usize {
        self.calls()
            .iter()
            .filter(|call| std::mem::discriminant(*call) == std::mem::discriminant(expected))
            .count()
    }

    fn record(&self, call: MultipartCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl MultipartStore for RecordingMultipart {
    async fn create_multipart(&self, path: &Path) -> object_store::Result<MultipartId> {
        self.record(MultipartCall::Create);
        self.inner.create_multipart(path).await
    }

    async fn put_part(
        &self,
        path: &Path,
        id: &MultipartId,
        part_idx: usize,
        data: PutPayload,
    ) -> object_store::Result<PartId> {
        self.record(MultipartCall::PutPart {
            part_idx,
            len: data.content_length(),
        });
        if self.fail_on_part == Some(part_idx as u32 + 1) {
            return Err(object_store::Error::Generic {
                store: "recording",
                source: "injected part failure".into(),
            });
        }
        self.inner.put_part(path, id, part_idx, data).await
    }

    async fn complete_multipart(
        &self,
        path: &Path,
        id: &MultipartId,
        parts: Vec<PartId>,
    ) -> object_store::Result<PutResult> {
        self.record(MultipartCall::Complete { parts: parts.len() });
        self.inner.complete_multipart(path, id, parts).await
    }

    async fn abort_multipart(&self, path: &Path, id: &MultipartId) -> object_store::Result<()> {
        self.record(MultipartCall::Abort);
        self.inner.abort_multipart(path, id).await
    }
}

/// Blob storage over a shared in-memory store whose multipart calls are
/// recorded.
pub fn recording_storage(
    fail_on_part: Option<u32>,
) -> (Arc<BlobStorage>, Arc<RecordingMultipart>) {
    let memory = Arc::new(InMemory::new());
    let recording = Arc::new(match fail_on_part {
        Some(part_number) => RecordingMultipart::failing_on_part(memory.clone(), part_number),
        None => RecordingMultipart::new(memory.clone()),
    });
    let storage = BlobStorage::from_parts(memory, recording.clone(), Path::default());
    (Arc::new(storage), recording)
}
