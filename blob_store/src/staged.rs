use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    multipart::{MultipartStore, PartId},
    path::Path,
    MultipartId,
    ObjectStore,
    PutPayload,
    PutResult,
    Result,
    WriteMultipart,
};
use tracing::warn;
use uuid::Uuid;

/// Multipart transfers for stores without native multipart support.
///
/// Each part is written as its own object under `staging/<upload id>/`.
/// Completing the transfer streams the parts, in the order given, into the
/// destination and then removes them.
#[derive(Debug)]
pub struct StagedMultipart {
    object_store: Arc<dyn ObjectStore>,
    staging: Path,
}

impl StagedMultipart {
    pub fn new(object_store: Arc<dyn ObjectStore>, staging: Path) -> Self {
        Self {
            object_store,
            staging,
        }
    }

    fn part_location(&self, id: &MultipartId, part_idx: usize) -> Path {
        self.staging.child(id.as_str()).child(format!("{:06}", part_idx))
    }

    async fn remove_staged(&self, id: &MultipartId) -> Result<()> {
        let prefix = self.staging.child(id.as_str());
        let locations: Vec<Path> = self
            .object_store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        for location in locations {
            match self.object_store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn assemble(&self, path: &Path, parts: &[PartId]) -> Result<PutResult> {
        let upload = self.object_store.put_multipart(path).await?;
        let mut writer = WriteMultipart::new(upload);
        for part in parts {
            let location = Path::parse(&part.content_id)?;
            let mut chunks = match self.object_store.get(&location).await {
                Ok(res) => res.into_stream(),
                Err(e) => {
                    writer.abort().await?;
                    return Err(e);
                }
            };
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        writer.abort().await?;
                        return Err(e);
                    }
                };
                writer.wait_for_capacity(1).await?;
                writer.write(&chunk);
            }
        }
        writer.finish().await
    }
}

#[async_trait]
impl MultipartStore for StagedMultipart {
    async fn create_multipart(&self, _path: &Path) -> Result<MultipartId> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn put_part(
        &self,
        _path: &Path,
        id: &MultipartId,
        part_idx: usize,
        data: PutPayload,
    ) -> Result<PartId> {
        let location = self.part_location(id, part_idx);
        self.object_store.put(&location, data).await?;
        Ok(PartId {
            content_id: location.to_string(),
        })
    }

    async fn complete_multipart(
        &self,
        path: &Path,
        id: &MultipartId,
        parts: Vec<PartId>,
    ) -> Result<PutResult> {
        let res = self.assemble(path, &parts).await?;
        if let Err(e) = self.remove_staged(id).await {
            warn!(upload_id = %id, "failed to remove staged parts: {:?}", e);
        }
        Ok(res)
    }

    async fn abort_multipart(&self, _path: &Path, id: &MultipartId) -> Result<()> {
        self.remove_staged(id).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn test_abort_removes_staged_parts() -> anyhow::Result<()> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let staged = StagedMultipart::new(store.clone(), Path::from("_multipart"));
        let dest = Path::from("dest");

        let id = staged.create_multipart(&dest).await?;
        staged
            .put_part(&dest, &id, 0, PutPayload::from(Bytes::from_static(b"a")))
            .await?;
        staged
            .put_part(&dest, &id, 1, PutPayload::from(Bytes::from_static(b"b")))
            .await?;
        let listed: Vec<_> = store.list(None).try_collect().await?;
        assert_eq!(listed.len(), 2);

        staged.abort_multipart(&dest, &id).await?;
        let listed: Vec<_> = store.list(None).try_collect().await?;
        assert!(listed.is_empty());
        assert!(store.head(&dest).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_follows_given_order() -> anyhow::Result<()> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let staged = StagedMultipart::new(store.clone(), Path::from("_multipart"));
        let dest = Path::from("dest");

        let id = staged.create_multipart(&dest).await?;
        let first = staged
            .put_part(&dest, &id, 0, PutPayload::from(Bytes::from_static(b"first,")))
            .await?;
        let second = staged
            .put_part(&dest, &id, 1, PutPayload::from(Bytes::from_static(b"second")))
            .await?;
        staged
            .complete_multipart(&dest, &id, vec![first, second])
            .await?;

        let bytes = store.get(&dest).await?.bytes().await?;
        assert_eq!(bytes, Bytes::from_static(b"first,second"));
        let listed: Vec<_> = store.list(Some(&Path::from("_multipart"))).try_collect().await?;
        assert!(listed.is_empty());
        Ok(())
    }
}
