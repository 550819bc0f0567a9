//! Persistence layer: task record storage over interchangeable backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod redis_backend;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;

use std::sync::Arc;

pub use libsql_backend::LibSqlTaskStore;
pub use memory::MemoryTaskStore;
pub use redis_backend::RedisTaskStore;
pub use traits::TaskStore;

use crate::config::StoreBackend;
use crate::error::StoreError;

/// Open the backend selected by configuration.
pub async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn TaskStore>, StoreError> {
    let store: Arc<dyn TaskStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryTaskStore::new()),
        StoreBackend::Redis { url } => Arc::new(RedisTaskStore::connect(url).await?),
        StoreBackend::LibSql { path } => Arc::new(LibSqlTaskStore::new_local(path).await?),
    };
    tracing::info!(backend = store.backend_name(), "Task store ready");
    Ok(store)
}
