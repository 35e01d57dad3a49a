//! Host registry: which workers live on which machine. Used by the garbage
//! collector to tell a dead peer from a worker on a host we cannot probe.

use anyhow::Result;

use crate::store::Store;

#[derive(Debug, Clone)]
pub struct HostRegistry {
    name: String,
}

impl HostRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn register_worker(&self, store: &mut Store, worker_id: &str) -> Result<()> {
        store.add_host(&self.name).await?;
        store.add_host_worker(&self.name, worker_id).await?;
        Ok(())
    }

    pub async fn unregister_worker(&self, store: &mut Store, worker_id: &str) -> Result<()> {
        store.remove_host_worker(&self.name, worker_id).await?;
        if store.host_workers(&self.name).await?.is_empty() {
            store.remove_host(&self.name).await?;
        }
        Ok(())
    }

    /// Re-assert presence; cheap enough to run from every heartbeat.
    pub async fn keep_alive(&self, store: &mut Store) -> Result<()> {
        store.add_host(&self.name).await?;
        Ok(())
    }

    pub async fn workers(&self, store: &mut Store) -> Result<Vec<String>> {
        store.host_workers(&self.name).await
    }
}

/// Current machine hostname, used for worker identity and GC decisions.
pub fn detect_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    #[tokio::test]
    async fn host_registration_lifecycle() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let host = HostRegistry::new("box-1");

        host.register_worker(&mut ctx.store, "box-1:10:0.0.0")
            .await
            .unwrap();
        host.register_worker(&mut ctx.store, "box-1:11:0.0.0")
            .await
            .unwrap();
        assert!(ctx.store.is_host("box-1").await.unwrap());
        assert_eq!(host.workers(&mut ctx.store).await.unwrap().len(), 2);

        host.unregister_worker(&mut ctx.store, "box-1:10:0.0.0")
            .await
            .unwrap();
        assert!(ctx.store.is_host("box-1").await.unwrap());

        host.unregister_worker(&mut ctx.store, "box-1:11:0.0.0")
            .await
            .unwrap();
        assert!(!ctx.store.is_host("box-1").await.unwrap());
    }

    #[test]
    fn hostname_detection_is_non_empty() {
        assert!(!detect_hostname().is_empty());
    }
}
