pub mod database;
pub mod memory_store;
pub mod token;

use std::sync::Arc;

use bots_core::config::DatabaseConfig;
use bots_core::{DispatchResult, TaskStore};
use tracing::info;

pub use database::SqliteTaskStore;
pub use memory_store::InMemoryTaskStore;

/// 根据配置创建任务存储
pub async fn create_store(config: &DatabaseConfig) -> DispatchResult<Arc<dyn TaskStore>> {
    if config.is_in_memory() {
        info!("使用内存任务存储");
        return Ok(Arc::new(InMemoryTaskStore::new()));
    }

    info!("使用SQLite任务存储: {}", config.url);
    let store = SqliteTaskStore::connect(&config.url, config.max_connections).await?;
    Ok(Arc::new(store))
}
