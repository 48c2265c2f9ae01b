use log::debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::container::Container;
use crate::error::BerthError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate id {0}")]
    DuplicateId(String),
    #[error("not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Query shape understood by a container collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Id(String),
    AppName(String),
}

impl Filter {
    pub fn matches(&self, container: &Container) -> bool {
        match self {
            Filter::Id(id) => &container.id == id,
            Filter::AppName(name) => &container.app_name == name,
        }
    }
}

/// A document collection holding container records.
pub trait ContainerCollection: Send + Sync + 'static + Clone {
    fn find_one(
        &self,
        filter: &Filter,
    ) -> impl Future<Output = Result<Option<Container>, StoreError>> + Send;

    /// Matching records in insertion order.
    fn find(&self, filter: &Filter) -> impl Future<Output = Result<Vec<Container>, StoreError>> + Send;

    fn insert(&self, container: &Container) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replaces the record with the same id; `NotFound` if there is none.
    fn update(&self, container: &Container) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns whether a record was removed.
    fn remove_id(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

#[derive(Clone, Default)]
pub struct MemoryCollection {
    docs: Arc<RwLock<Vec<Container>>>,
}

impl ContainerCollection for MemoryCollection {
    async fn find_one(&self, filter: &Filter) -> Result<Option<Container>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.iter().find(|c| filter.matches(c)).cloned())
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Container>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.iter().filter(|c| filter.matches(c)).cloned().collect())
    }

    async fn insert(&self, container: &Container) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        if docs.iter().any(|c| c.id == container.id) {
            return Err(StoreError::DuplicateId(container.id.clone()));
        }
        docs.push(container.clone());
        Ok(())
    }

    async fn update(&self, container: &Container) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .iter_mut()
            .find(|c| c.id == container.id)
            .ok_or(StoreError::NotFound)?;
        *doc = container.clone();
        Ok(())
    }

    async fn remove_id(&self, id: &str) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|c| c.id != id);
        Ok(docs.len() != before)
    }
}

/// Container records, keyed by container ID.
#[derive(Clone)]
pub struct ContainerStore<C: ContainerCollection> {
    collection: C,
}

impl<C: ContainerCollection> ContainerStore<C> {
    pub fn new(collection: C) -> Self {
        Self { collection }
    }

    pub async fn insert(&self, container: &Container) -> Result<(), BerthError> {
        self.collection.insert(container).await?;
        Ok(())
    }

    pub async fn get_container(&self, id: &str) -> Result<Container, BerthError> {
        self.collection
            .find_one(&Filter::Id(id.to_string()))
            .await?
            .ok_or_else(|| BerthError::NotFound(format!("container {id}")))
    }

    pub async fn list_app_containers(&self, app_name: &str) -> Result<Vec<Container>, BerthError> {
        Ok(self
            .collection
            .find(&Filter::AppName(app_name.to_string()))
            .await?)
    }

    /// Image recorded by a previous commit for `app_name`, if any.
    pub async fn app_image(&self, app_name: &str) -> Result<Option<String>, BerthError> {
        let containers = self.list_app_containers(app_name).await?;
        Ok(containers
            .into_iter()
            .map(|c| c.image)
            .find(|image| !image.is_empty()))
    }

    pub async fn set_status(&self, container: &mut Container, status: &str) -> Result<(), BerthError> {
        let mut updated = container.clone();
        updated.status = status.to_string();
        self.update(&updated).await?;
        *container = updated;
        Ok(())
    }

    pub async fn set_image(&self, container: &mut Container, image: &str) -> Result<(), BerthError> {
        let mut updated = container.clone();
        updated.image = image.to_string();
        self.update(&updated).await?;
        *container = updated;
        Ok(())
    }

    pub async fn update(&self, container: &Container) -> Result<(), BerthError> {
        match self.collection.update(container).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(BerthError::NotFound(format!(
                "container {}",
                container.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Deleting a record that does not exist succeeds.
    pub async fn remove(&self, id: &str) -> Result<(), BerthError> {
        if !self.collection.remove_id(id).await? {
            debug!("container {id} already absent from store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, kind: &str, app_name: &str) -> Container {
        Container {
            id: id.to_string(),
            kind: kind.to_string(),
            app_name: app_name.to_string(),
            ..Default::default()
        }
    }

    async fn store_with(containers: &[Container]) -> ContainerStore<MemoryCollection> {
        let store = ContainerStore::new(MemoryCollection::default());
        for c in containers {
            store.insert(c).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_get_container() {
        let store = store_with(&[
            container("abcdef", "python", ""),
            container("fedajs", "ruby", ""),
            container("wat", "java", ""),
        ])
        .await;

        let c = store.get_container("abcdef").await.unwrap();
        assert_eq!(c.id, "abcdef");
        assert_eq!(c.kind, "python");

        let err = store.get_container("wut").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_app_containers() {
        let store = store_with(&[
            container("abcdef", "python", "something"),
            container("fedajs", "python", "something"),
            container("wat", "java", "otherthing"),
        ])
        .await;

        let containers = store.list_app_containers("something").await.unwrap();
        let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["abcdef", "fedajs"]);

        let containers = store.list_app_containers("otherthing").await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "wat");

        assert!(store.list_app_containers("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_status_and_image() {
        let mut c = container("something-300", "", "");
        let store = store_with(&[c.clone()]).await;

        store.set_status(&mut c, "what?!").await.unwrap();
        store.set_image(&mut c, "newimage").await.unwrap();

        let stored = store.get_container("something-300").await.unwrap();
        assert_eq!(stored.status, "what?!");
        assert_eq!(stored.image, "newimage");
        assert_eq!(stored, c);
    }

    #[tokio::test]
    async fn test_set_status_on_missing_record_keeps_working_copy() {
        let store = store_with(&[]).await;
        let mut c = container("gone", "", "");
        let err = store.set_status(&mut c, "running").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(c.status, "");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = store_with(&[container("abcdef", "python", "app")]).await;
        store.remove("abcdef").await.unwrap();
        store.remove("abcdef").await.unwrap();
        assert!(store.get_container("abcdef").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let store = store_with(&[container("abcdef", "python", "app")]).await;
        let err = store
            .insert(&container("abcdef", "ruby", "app"))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::Store(StoreError::DuplicateId(_))));
    }
}
