mod consul;
mod fs;
mod models;

pub use consul::ConsulStore;
pub use fs::FsStore;
pub use models::PersistedBinding;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::Result;

/// KV abstraction the dispatcher persists fingerprint bindings through.
/// Keys are bare names; each backend maps them under its own
/// `process/alerts` root. Values are opaque bytes (UTF-8 JSON in practice).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backend (create directories, bootstrap status keys).
    async fn init(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove the key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List stored keys. `recursive` controls single-level truncation on
    /// backends with hierarchical keys.
    async fn list(&self, recursive: bool) -> Result<Vec<String>>;

    /// The key a fingerprint binding lives under. The filesystem backend
    /// keys by fingerprint while the remote KV keys by alert name; the
    /// divergence is inherited behaviour, kept explicit here.
    fn binding_key(&self, fingerprint: &str, alert_name: &str) -> String;
}

pub async fn create_store(config: &ServerConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match &config.consul {
        Some(consul) => Arc::new(ConsulStore::new(&consul.address)),
        None => Arc::new(FsStore::new(&config.data_dir)),
    };
    store.init().await?;
    Ok(store)
}
