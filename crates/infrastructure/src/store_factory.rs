use std::sync::Arc;

use jobqueue_core::{
    config::{StoreBackend, StoreConfig},
    QueueResult, Store,
};
use tracing::{debug, info};

use crate::{MemoryStore, RedisStore};

pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(config: &StoreConfig) -> QueueResult<Arc<dyn Store>> {
        debug!("Creating store with backend: {:?}", config.backend);

        match config.backend {
            StoreBackend::Memory => {
                info!("Initializing in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Redis => {
                info!("Initializing Redis store");
                config.redis.validate()?;
                let store = RedisStore::new(config.redis.clone()).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_memory_store() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        let store = StoreFactory::create(&config).await.unwrap();
        assert!(store.ping().await.is_ok());
    }
}
