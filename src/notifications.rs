use anyhow::Result;
use async_trait::async_trait;
use metadata_store::FileMetadata;
use tracing::info;

/// Told about every upload that completed and was recorded.
#[async_trait]
pub trait UploadNotifier: Send + Sync {
    async fn upload_completed(&self, file: &FileMetadata) -> Result<()>;
}

/// Stands in for a mail integration: logs the message that would be sent to
/// the uploader.
pub struct EmailNotifier {
    sender: String,
}

impl EmailNotifier {
    pub fn new(sender: &str) -> Self {
        Self {
            sender: sender.to_string(),
        }
    }

    fn subject(file: &FileMetadata) -> String {
        format!("Your file {} was uploaded", file.filename)
    }
}

#[async_trait]
impl UploadNotifier for EmailNotifier {
    async fn upload_completed(&self, file: &FileMetadata) -> Result<()> {
        info!(
            from = %self.sender,
            to = %file.email,
            subject = %Self::subject(file),
            s3_key = %file.s3_key,
            "sending upload notification"
        );
        Ok(())
    }
}
