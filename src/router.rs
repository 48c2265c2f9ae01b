use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("backend {0} not found")]
    BackendNotFound(String),
    #[error("route {1} not found in backend {0}")]
    RouteNotFound(String, String),
    #[error("router unavailable: {0}")]
    Unavailable(String),
}

/// Load-balancer backend registration.
pub trait Router: Send + Sync + 'static + Clone {
    fn add_backend(&self, name: &str) -> impl Future<Output = Result<(), RouterError>> + Send;

    fn remove_backend(&self, name: &str) -> impl Future<Output = Result<(), RouterError>> + Send;

    fn add_route(
        &self,
        name: &str,
        address: &str,
    ) -> impl Future<Output = Result<(), RouterError>> + Send;

    fn remove_route(
        &self,
        name: &str,
        address: &str,
    ) -> impl Future<Output = Result<(), RouterError>> + Send;

    fn has_route(&self, name: &str, address: &str) -> impl Future<Output = bool> + Send;
}

/// Router keeping its backends in process memory.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    backends: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl Router for MemoryRouter {
    async fn add_backend(&self, name: &str) -> Result<(), RouterError> {
        self.backends
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn remove_backend(&self, name: &str) -> Result<(), RouterError> {
        self.backends
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RouterError::BackendNotFound(name.to_string()))
    }

    async fn add_route(&self, name: &str, address: &str) -> Result<(), RouterError> {
        let mut backends = self.backends.write().await;
        let routes = backends
            .get_mut(name)
            .ok_or_else(|| RouterError::BackendNotFound(name.to_string()))?;
        if !routes.iter().any(|r| r == address) {
            routes.push(address.to_string());
        }
        Ok(())
    }

    async fn remove_route(&self, name: &str, address: &str) -> Result<(), RouterError> {
        let mut backends = self.backends.write().await;
        let routes = backends
            .get_mut(name)
            .ok_or_else(|| RouterError::BackendNotFound(name.to_string()))?;
        let before = routes.len();
        routes.retain(|r| r != address);
        if routes.len() == before {
            return Err(RouterError::RouteNotFound(
                name.to_string(),
                address.to_string(),
            ));
        }
        Ok(())
    }

    async fn has_route(&self, name: &str, address: &str) -> bool {
        self.backends
            .read()
            .await
            .get(name)
            .is_some_and(|routes| routes.iter().any(|r| r == address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes() {
        let router = MemoryRouter::default();
        router.add_backend("myapp").await.unwrap();
        router
            .add_route("myapp", "http://10.10.10.10:49153")
            .await
            .unwrap();
        assert!(router.has_route("myapp", "http://10.10.10.10:49153").await);

        router
            .remove_route("myapp", "http://10.10.10.10:49153")
            .await
            .unwrap();
        assert!(!router.has_route("myapp", "http://10.10.10.10:49153").await);
        assert_eq!(
            router.remove_route("myapp", "http://10.10.10.10:49153").await,
            Err(RouterError::RouteNotFound(
                "myapp".to_string(),
                "http://10.10.10.10:49153".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_route_requires_backend() {
        let router = MemoryRouter::default();
        assert_eq!(
            router.add_route("nope", "http://10.10.10.10:1").await,
            Err(RouterError::BackendNotFound("nope".to_string()))
        );
        assert!(router.remove_backend("nope").await.is_err());
    }
}
