use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::uploads::DEFAULT_CHUNK_SIZE;

const ENV_PREFIX: &str = "UPLOAD_SERVER_";

// S3 rejects non-final multipart parts smaller than this.
const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub chunk_size_bytes: usize,
    pub progress_channel_capacity: usize,
    pub max_upload_size_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            progress_channel_capacity: 64,
            max_upload_size_bytes: 5 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable OpenTelemetry tracing
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // If not set, the default endpoint of the otlp exporter is used.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: String,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub blob_storage: BlobStorageConfig,
    /// Location of the metadata table, relative to the blob storage root.
    pub metadata_path: String,
    /// From address of upload notification emails.
    pub notification_sender: String,
    pub upload: UploadConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: "local".to_string(),
            instance_id: nanoid::nanoid!(),
            listen_addr: "0.0.0.0:8000".to_string(),
            structured_logging: false,
            blob_storage: Default::default(),
            metadata_path: "metadata".to_string(),
            notification_sender: "uploads@localhost".to_string(),
            upload: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by the YAML file at `path`, then by
    /// `UPLOAD_SERVER_*` environment variables.
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", path, e))?;
        Self::extract(Self::figment().merge(Yaml::string(&config_str)))
    }

    /// Defaults overridden by `UPLOAD_SERVER_*` environment variables.
    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Self::figment())
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default()))
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        let blob_url = Url::parse(&self.blob_storage.path).map_err(|e| {
            anyhow!(
                "invalid blob storage path {}: {}",
                self.blob_storage.path,
                e
            )
        })?;
        if self.metadata_path.trim_matches('/').is_empty() {
            return Err(anyhow!("metadata path must not be empty"));
        }
        if self.upload.chunk_size_bytes == 0 {
            return Err(anyhow!("upload chunk size must be greater than zero"));
        }
        if blob_url.scheme() == "s3" && self.upload.chunk_size_bytes < S3_MIN_PART_SIZE {
            return Err(anyhow!(
                "upload chunk size {} is below the S3 minimum part size of {}",
                self.upload.chunk_size_bytes,
                S3_MIN_PART_SIZE
            ));
        }
        if self.upload.progress_channel_capacity == 0 {
            return Err(anyhow!(
                "progress channel capacity must be greater than zero"
            ));
        }
        if self.upload.max_upload_size_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        Ok(())
    }
}
