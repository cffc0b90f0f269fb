//! Async facade over a [`CacheStorage`] backend.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey};
use crate::net::AgentResponse;

/// The process-wide set of named stores.
///
/// Storage calls run on the blocking pool so a slow disk never stalls
/// request handling. Cloning shares the same backend.
pub struct StoreRegistry<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage + 'static> StoreRegistry<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  async fn run<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
      .await
      .map_err(|e| eyre!("Store task failed: {}", e))?
  }

  /// Open (creating if absent) the store for `name`.
  pub async fn open(&self, name: &str) -> Result<()> {
    let name = name.to_string();
    self.run(move |s| s.open_store(&name)).await
  }

  pub async fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let store = store.to_string();
    let key = key.clone();
    self.run(move |s| s.get_entry(&store, &key)).await
  }

  /// Write `response` under `key`.
  ///
  /// Returns `Ok(false)` without touching the store when the key is not a GET
  /// or the response is not a complete 2xx (`206` is refused).
  pub async fn put(&self, store: &str, key: &RequestKey, response: &AgentResponse) -> Result<bool> {
    if !key.is_storable() || !response.is_cacheable() {
      return Ok(false);
    }

    let store = store.to_string();
    let key = key.clone();
    let response = response.clone();
    self
      .run(move |s| s.put_entry(&store, &key, &response))
      .await?;

    Ok(true)
  }

  /// Like [`put`](Self::put), but a failure is only logged.
  pub async fn put_best_effort(&self, store: &str, key: &RequestKey, response: &AgentResponse) {
    match self.put(store, key, response).await {
      Ok(true) => debug!(store, url = key.url(), "Stored response"),
      Ok(false) => debug!(
        store,
        url = key.url(),
        status = response.status,
        "Response not storable"
      ),
      Err(e) => warn!(store, url = key.url(), error = %e, "Failed to store response"),
    }
  }

  pub async fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let key = key.clone();
    self.run(move |s| s.match_any(&key)).await
  }

  pub async fn list_names(&self) -> Result<Vec<String>> {
    self.run(|s| s.store_names()).await
  }

  pub async fn delete(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self.run(move |s| s.delete_store(&name)).await
  }

  /// Delete every store whose name is not in `whitelist`.
  ///
  /// Returns the names that were deleted. A failed deletion is logged and
  /// skipped; only a failure to enumerate stores is an error.
  pub async fn reconcile(&self, whitelist: &[String]) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.list_names().await? {
      if whitelist.contains(&name) {
        continue;
      }

      match self.delete(&name).await {
        Ok(_) => {
          info!(store = %name, "Deleted stale store");
          deleted.push(name);
        }
        Err(e) => warn!(store = %name, error = %e, "Failed to delete stale store"),
      }
    }

    Ok(deleted)
  }
}

impl<S: CacheStorage> Clone for StoreRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use url::Url;

  fn registry() -> StoreRegistry<SqliteStorage> {
    StoreRegistry::new(SqliteStorage::open_in_memory().unwrap())
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse(&format!("https://example.com{}", path)).unwrap())
  }

  #[tokio::test]
  async fn test_put_skips_unsuccessful_responses() {
    let registry = registry();

    let stored = registry
      .put("dynamic", &key("/api/x"), &AgentResponse::new(500, "boom"))
      .await
      .unwrap();
    assert!(!stored);
    assert!(registry.list_names().await.unwrap().is_empty());

    let stored = registry
      .put("dynamic", &key("/api/x"), &AgentResponse::new(200, "ok"))
      .await
      .unwrap();
    assert!(stored);
    assert!(registry.get("dynamic", &key("/api/x")).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_put_skips_non_get_keys() {
    let registry = registry();
    let url = Url::parse("https://example.com/api/x").unwrap();

    let stored = registry
      .put("dynamic", &RequestKey::new("POST", &url), &AgentResponse::new(200, "ok"))
      .await
      .unwrap();
    assert!(!stored);
  }

  #[tokio::test]
  async fn test_reconcile_deletes_stores_outside_whitelist() {
    let registry = registry();
    for name in ["A", "B", "C"] {
      registry.open(name).await.unwrap();
    }
    registry
      .put("C", &key("/old"), &AgentResponse::new(200, "old"))
      .await
      .unwrap();

    let whitelist = vec!["A".to_string(), "B".to_string()];
    let deleted = registry.reconcile(&whitelist).await.unwrap();

    assert_eq!(deleted, vec!["C".to_string()]);
    assert_eq!(registry.list_names().await.unwrap(), whitelist);
    assert!(registry.match_any(&key("/old")).await.unwrap().is_none());
  }
}
