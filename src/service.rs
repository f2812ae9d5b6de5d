use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::BlobStorage;
use metadata_store::MetadataStore;
use object_store::path::Path;
use tokio::signal;
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    files::FileService,
    notifications::EmailNotifier,
    routes::{create_routes, RouteState},
    uploads::{channel::ProgressChannelRegistry, Uploader},
};

// In-flight uploads get this long to finish after a shutdown signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub blob_storage: Arc<BlobStorage>,
    pub metadata: Arc<MetadataStore>,
    pub progress: Arc<ProgressChannelRegistry>,
    pub files: Arc<FileService>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );

        let metadata_suffix =
            Path::parse(&config.metadata_path).context("invalid metadata path")?;
        let metadata_path: Path = blob_storage
            .get_path()
            .parts()
            .chain(metadata_suffix.parts())
            .collect();
        let metadata = Arc::new(
            MetadataStore::new(blob_storage.get_object_store(), metadata_path)
                .await
                .context("error initializing metadata store")?,
        );

        let progress = Arc::new(ProgressChannelRegistry::new(
            config.upload.progress_channel_capacity,
        ));
        let uploader = Uploader::new(
            blob_storage.clone(),
            progress.clone(),
            config.upload.chunk_size_bytes,
        );
        let notifier = Arc::new(EmailNotifier::new(&config.notification_sender));
        let files = Arc::new(FileService::new(
            blob_storage.clone(),
            metadata.clone(),
            uploader,
            notifier,
        ));

        Ok(Self {
            config,
            blob_storage,
            metadata,
            progress,
            files,
        })
    }

    pub fn routes(&self) -> Router {
        let route_state = RouteState {
            files: self.files.clone(),
            progress: self.progress.clone(),
        };
        create_routes(route_state, &self.config)
    }

    pub async fn start(&self) -> Result<()> {
        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let served = axum_server::bind(addr)
            .handle(handle)
            .serve(self.routes().into_make_service())
            .await;

        if let Err(e) = self.metadata.close().await {
            error!("failed to close metadata store: {:?}", e);
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    info!("signal received, shutting down server gracefully");
}
