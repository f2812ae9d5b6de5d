use std::{error::Error as StdError, sync::Arc};

use metrics::{kv_storage::Metrics, Timer};
use object_store::{path::Path, ObjectStore};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use slatedb::Db;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("metadata kv store failure during {op}: {source}")]
    Kv {
        op: &'static str,
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("malformed metadata record for {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

impl Error {
    fn kv(op: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Kv {
            op,
            source: Box::new(source),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One row of the uploads table, keyed by storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub s3_key: String,
    pub filename: String,
    pub email: String,
    /// Epoch milliseconds.
    pub uploaded_at: u64,
}

pub struct MetadataStore {
    kv_store: Arc<Db>,
    metrics: Metrics,
}

impl MetadataStore {
    pub async fn new(object_store: Arc<dyn ObjectStore>, path: Path) -> Result<Self> {
        let kv_store = Db::open(path, object_store)
            .await
            .map_err(|e| Error::kv("open", e))?;
        Ok(Self {
            kv_store: Arc::new(kv_store),
            metrics: Metrics::new(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.kv_store.close().await.map_err(|e| Error::kv("close", e))
    }

    pub async fn put(&self, record: &FileMetadata) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.writes, timer_kvs);

        let value = serde_json::to_vec(record)?;
        self.kv_store
            .put(record.s3_key.as_bytes(), &value)
            .await
            .map_err(|e| Error::kv("put", e))?;
        debug!(s3_key = %record.s3_key, "stored file metadata");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<FileMetadata>> {
        let timer_kvs = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.reads, timer_kvs);

        let value = self
            .kv_store
            .get(key.as_bytes())
            .await
            .map_err(|e| Error::kv("get", e))?;
        value
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|source| Error::Decode {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.writes, timer_kvs);

        self.kv_store
            .delete(key.as_bytes())
            .await
            .map_err(|e| Error::kv("delete", e))
    }

    /// Renames the file recorded under `key`. Returns `None`, and writes
    /// nothing, when no record exists.
    pub async fn update_filename(
        &self,
        key: &str,
        new_filename: &str,
    ) -> Result<Option<FileMetadata>> {
        let Some(mut record) = self.get(key).await? else {
            return Ok(None);
        };
        record.filename = new_filename.to_string();
        self.put(&record).await?;
        Ok(Some(record))
    }
}
