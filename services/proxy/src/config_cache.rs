//! Configuration Cache.
//!
//! Written only by a store's Worker Supervisor at start-up and on every
//! restart; read by the Request Server for `ID` and `CONFIG` responses. A
//! read-mostly lock suffices — the block is replaced atomically, never
//! mutated in place.

use std::collections::HashMap;
use std::sync::Arc;

use pot_protocol::ConfigBlock;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct ConfigCache {
    blocks: Arc<RwLock<HashMap<String, ConfigBlock>>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, store: &str, block: ConfigBlock) {
        self.blocks.write().await.insert(store.to_owned(), block);
    }

    pub async fn get(&self, store: &str) -> Option<ConfigBlock> {
        self.blocks.read().await.get(store).cloned()
    }

    /// `{name, id}` entries for every known store, or just the one matching
    /// `store_filter` if given, per the `ID` request semantics.
    pub async fn id_entries(&self, store_filter: Option<&str>) -> Vec<serde_json::Value> {
        let blocks = self.blocks.read().await;
        blocks
            .values()
            .filter(|block| store_filter.is_none_or(|store| block.name == store))
            .map(|block| serde_json::json!({ "name": block.name, "id": block.id.to_hex() }))
            .collect()
    }
}
