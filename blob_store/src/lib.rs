use std::{env, path::PathBuf, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use metrics::{blob_storage::Metrics, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    local::LocalFileSystem,
    memory::InMemory,
    multipart::{MultipartStore, PartId},
    path::Path,
    MultipartId,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

mod staged;
pub use staged::StagedMultipart;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("invalid blob storage config: {0}")]
    InvalidConfig(String),

    #[error("invalid part number {0}, part numbers start at 1")]
    InvalidPartNumber(u32),

    #[error(transparent)]
    Store {
        #[from]
        source: object_store::Error,
    },
}

impl Error {
    fn from_store(key: &str, source: object_store::Error) -> Self {
        match source {
            object_store::Error::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            source => Self::Store { source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Object store URL: `s3://bucket/prefix`, `file:///some/dir` or `memory:///`.
    pub path: String,
    pub region: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            region: None,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("upload_storage/blobs");
        BlobStorageConfig::new(&blob_store_path.to_string_lossy())
    }
}

/// Handle to an in-flight multipart transfer.
///
/// Owned by exactly one upload. Aborting consumes it.
#[derive(Debug, Clone)]
pub struct MultipartTransfer {
    pub key: String,
    location: Path,
    upload_id: MultipartId,
}

impl MultipartTransfer {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

/// Acknowledgement for one uploaded part, required to finalize the transfer.
#[derive(Debug, Clone)]
pub struct PartToken {
    pub part_number: u32,
    pub part_id: PartId,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: String,
    pub url: String,
    pub e_tag: Option<String>,
}

pub struct BlobStream {
    pub size_bytes: u64,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    multipart_store: Arc<dyn MultipartStore>,
    path: Path,
    metrics: Metrics,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .parse::<Url>()
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", config.path, e)))?;
        let (scheme, path) = ObjectStoreScheme::parse(&url)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", config.path, e)))?;
        info!("using blob store path: {}", config.path);
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let s3 = Arc::new(Self::build_s3(&config.path, config.region.as_deref())?);
                Ok(Self::from_parts(s3.clone(), s3, path))
            }
            ObjectStoreScheme::Memory => {
                let memory = Arc::new(InMemory::new());
                Ok(Self::from_parts(memory.clone(), memory, path))
            }
            ObjectStoreScheme::Local => {
                let local: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new());
                let staged = Arc::new(StagedMultipart::new(local.clone(), path.child("_multipart")));
                Ok(Self::from_parts(local, staged, path))
            }
            other => Err(Error::InvalidConfig(format!(
                "unsupported object store scheme: {:?}",
                other
            ))),
        }
    }

    /// Assembles a blob storage from an already built store. Used when the
    /// caller needs to wrap the multipart capability.
    pub fn from_parts(
        object_store: Arc<dyn ObjectStore>,
        multipart_store: Arc<dyn MultipartStore>,
        path: Path,
    ) -> Self {
        Self {
            object_store,
            multipart_store,
            path,
            metrics: Metrics::new(),
        }
    }

    fn build_s3(url_str: &str, region: Option<&str>) -> Result<object_store::aws::AmazonS3> {
        // inject AWS environment variables to prioritize keys over instance metadata
        // credentials.
        let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
            .filter_map(|(os_key, os_value)| {
                if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                    if key.starts_with("AWS_") {
                        if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                            return Some((config_key, String::from(value)));
                        }
                    }
                }
                None
            })
            .collect();

        let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
        for (key, value) in opts.iter() {
            s3_builder = s3_builder.with_config(*key, value.clone());
        }
        if let Some(region) = region {
            s3_builder = s3_builder.with_region(region);
        }
        Ok(s3_builder.build()?)
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    fn location(&self, key: &str) -> Path {
        self.path.child(key)
    }

    pub async fn create_multipart(&self, key: &str) -> Result<MultipartTransfer> {
        let timer_kvs = &[KeyValue::new("op", "create_multipart")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let location = self.location(key);
        let upload_id = self
            .multipart_store
            .create_multipart(&location)
            .await
            .map_err(|e| Error::from_store(key, e))?;
        Ok(MultipartTransfer {
            key: key.to_string(),
            location,
            upload_id,
        })
    }

    /// Uploads one part. `part_number` is 1-based.
    pub async fn put_part(
        &self,
        transfer: &MultipartTransfer,
        part_number: u32,
        data: Bytes,
    ) -> Result<PartToken> {
        let timer_kvs = &[KeyValue::new("op", "put_part")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        if part_number == 0 {
            return Err(Error::InvalidPartNumber(part_number));
        }
        let part_id = self
            .multipart_store
            .put_part(
                &transfer.location,
                &transfer.upload_id,
                (part_number - 1) as usize,
                PutPayload::from(data),
            )
            .await
            .map_err(|e| Error::from_store(&transfer.key, e))?;
        Ok(PartToken {
            part_number,
            part_id,
        })
    }

    /// Finalizes the transfer. Parts are assembled in the order given.
    pub async fn complete_multipart(
        &self,
        transfer: &MultipartTransfer,
        parts: Vec<PartToken>,
    ) -> Result<PutResult> {
        let timer_kvs = &[KeyValue::new("op", "complete_multipart")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let part_ids = parts.into_iter().map(|p| p.part_id).collect();
        let res = self
            .multipart_store
            .complete_multipart(&transfer.location, &transfer.upload_id, part_ids)
            .await
            .map_err(|e| Error::from_store(&transfer.key, e))?;
        Ok(PutResult {
            key: transfer.key.clone(),
            url: transfer.location.to_string(),
            e_tag: res.e_tag,
        })
    }

    pub async fn abort_multipart(&self, transfer: MultipartTransfer) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "abort_multipart")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        self.multipart_store
            .abort_multipart(&transfer.location, &transfer.upload_id)
            .await
            .map_err(|e| Error::from_store(&transfer.key, e))
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let timer_kvs = &[KeyValue::new("op", "head")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        match self.object_store.head(&self.location(key)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<BlobStream> {
        let timer_kvs = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let get_result = self
            .object_store
            .get(&self.location(key))
            .await
            .map_err(|e| Error::from_store(key, e))?;
        let size_bytes = get_result.meta.size;
        let key = key.to_string();
        let stream = get_result
            .into_stream()
            .map_err(move |e| Error::from_store(&key, e))
            .boxed();
        Ok(BlobStream { size_bytes, stream })
    }

    /// Deletes an object, failing with `NotFound` when it does not exist.
    ///
    /// Existence is checked first since S3 deletes of missing keys succeed.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let location = self.location(key);
        self.object_store
            .head(&location)
            .await
            .map_err(|e| Error::from_store(key, e))?;
        if let Err(e) = self.object_store.delete(&location).await {
            warn!(key, "failed to delete object: {:?}", e);
            return Err(Error::from_store(key, e));
        }
        Ok(())
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?.stream;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }
}
