use crate::resource::{ImageRepository, ImageRepositoryStatus, ResourceKey};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

static FIELD_MANAGER: &str = "image-repository-controller";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} was modified concurrently")]
    Conflict(ResourceKey),
    #[error("{0} no longer exists")]
    NotFound(ResourceKey),
    #[error("resource store request failed: {0}")]
    Backend(String),
}

/// Where `ImageRepository` records live.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageRepository>, StoreError>;

    /// Writes `status` only if the record still carries `resource_version`.
    async fn update_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &ImageRepositoryStatus,
    ) -> Result<ImageRepository, StoreError>;
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for Arc<T> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageRepository>, StoreError> {
        (**self).get(key).await
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &ImageRepositoryStatus,
    ) -> Result<ImageRepository, StoreError> {
        (**self).update_status(key, resource_version, status).await
    }
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceKey) -> Api<ImageRepository> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn kube_error(key: &ResourceKey, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict(key.clone()),
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ImageRepository>, StoreError> {
        self.api(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| kube_error(key, e))
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &ImageRepositoryStatus,
    ) -> Result<ImageRepository, StoreError> {
        // A resourceVersion in a merge patch makes the API server reject
        // stale writes with 409
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        debug!("Patching status of {} with patch {}", key, patch);
        self.api(key)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| kube_error(key, e))
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryStore;


#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ImageRepositorySpec;

    fn key() -> ResourceKey {
        ResourceKey::new("default", "alpine-image")
    }

    fn repository(image: &str) -> ImageRepository {
        ImageRepository::with_key(&key(), ImageRepositorySpec::new(image))
    }

    #[tokio::test]
    async fn test_apply_tracks_generation() {
        let store = MemoryStore::new();
        store.apply(repository("alpine"));
        assert_eq!(store.snapshot(&key()).unwrap().metadata.generation, Some(1));

        store.apply(repository("alpine"));
        assert_eq!(store.snapshot(&key()).unwrap().metadata.generation, Some(1));

        store.apply(repository("ubuntu"));
        assert_eq!(store.snapshot(&key()).unwrap().metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_update_status_is_compare_and_swap() {
        let store = MemoryStore::new();
        store.apply(repository("alpine"));
        let read = store.get(&key()).await.unwrap().unwrap();
        let version = read.metadata.resource_version.clone();

        let status = ImageRepositoryStatus {
            canonical_image_name: "index.docker.io/library/alpine".into(),
            ..Default::default()
        };
        let written = store
            .update_status(&key(), version.as_deref(), &status)
            .await
            .unwrap();
        assert_eq!(written.status.as_ref(), Some(&status));

        let stale = store.update_status(&key(), version.as_deref(), &status).await;
        assert_eq!(stale, Err(StoreError::Conflict(key())));
    }

    #[tokio::test]
    async fn test_injected_conflicts_and_missing_records() {
        let store = MemoryStore::new();
        let status = ImageRepositoryStatus::default();
        assert_eq!(
            store.update_status(&key(), None, &status).await,
            Err(StoreError::NotFound(key()))
        );

        store.apply(repository("alpine"));
        store.inject_conflicts(1);
        assert_eq!(
            store.update_status(&key(), None, &status).await,
            Err(StoreError::Conflict(key()))
        );
        assert!(store.update_status(&key(), None, &status).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_keeps_status() {
        let store = MemoryStore::new();
        store.apply(repository("alpine"));
        let status = ImageRepositoryStatus {
            consecutive_failures: 2,
            ..Default::default()
        };
        store.update_status(&key(), None, &status).await.unwrap();
        store.apply(repository("ubuntu"));
        assert_eq!(store.snapshot(&key()).unwrap().status, Some(status));
    }
}
