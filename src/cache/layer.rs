//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::registry::StoreRegistry;
use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey, Served};
use crate::net::{AgentRequest, AgentResponse, Fetch};

/// Caching discipline applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network, then any cached copy
  NetworkFirst,
  /// Static store, then network
  CacheFirst,
  /// Cached copy now, refreshed in the background
  StaleWhileRevalidate,
}

/// Cache layer that executes strategies against the store registry and the network.
///
/// `Err` from a strategy means neither the network nor the store could
/// answer; the caller hands the request to the offline fallback.
pub struct CacheLayer<S: CacheStorage> {
  registry: StoreRegistry<S>,
  network: Arc<dyn Fetch>,
  static_store: String,
  dynamic_store: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(
    registry: StoreRegistry<S>,
    network: Arc<dyn Fetch>,
    static_store: String,
    dynamic_store: String,
  ) -> Self {
    Self {
      registry,
      network,
      static_store,
      dynamic_store,
    }
  }

  pub async fn execute(&self, strategy: Strategy, request: &AgentRequest) -> Result<Served> {
    match strategy {
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Read from one store (or all of them), treating a store error as a miss.
  async fn lookup(&self, store: Option<&str>, key: &RequestKey) -> Option<CachedEntry> {
    let result = match store {
      Some(store) => self.registry.get(store, key).await,
      None => self.registry.match_any(key).await,
    };

    result.unwrap_or_else(|e| {
      warn!(url = key.url(), error = %e, "Store read failed; treating as miss");
      None
    })
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network; on success store in the dynamic store and return
  /// 2. On network failure, return any cached copy (offline mode)
  /// 3. Otherwise fail
  pub async fn network_first(&self, request: &AgentRequest) -> Result<Served> {
    let key = RequestKey::for_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        self
          .registry
          .put_best_effort(&self.dynamic_store, &key, &response)
          .await;
        Ok(Served::from_network(response))
      }
      Err(network_error) => {
        debug!(url = key.url(), error = %network_error, "Network failed; trying cache");
        match self.lookup(None, &key).await {
          Some(entry) => Ok(Served::from_cache(entry)),
          None => Err(eyre!(
            "Network failed for {} and nothing is cached: {}",
            key.url(),
            network_error
          )),
        }
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// A static store hit never touches the network. A miss is fetched and
  /// stored in the static store.
  pub async fn cache_first(&self, request: &AgentRequest) -> Result<Served> {
    let key = RequestKey::for_request(request);

    if let Some(entry) = self.lookup(Some(&self.static_store), &key).await {
      return Ok(Served::from_cache(entry));
    }

    let response = self.network.fetch(request).await?;
    self
      .registry
      .put_best_effort(&self.static_store, &key, &response)
      .await;
    Ok(Served::from_network(response))
  }

  /// Fetch with stale-while-revalidate strategy.
  ///
  /// A revalidation fetch is always spawned as a detached task that writes a
  /// successful response into the dynamic store. A cached copy is returned
  /// without waiting for it; there is no ordering between that return and the
  /// background write. Without a cached copy the caller waits for the fetch
  /// result only, never for the write.
  pub async fn stale_while_revalidate(&self, request: &AgentRequest) -> Result<Served> {
    let key = RequestKey::for_request(request);
    let cached = self.lookup(None, &key).await;

    let (tx, rx) = oneshot::channel::<Result<AgentResponse, String>>();
    let network = Arc::clone(&self.network);
    let registry = self.registry.clone();
    let store = self.dynamic_store.clone();
    let background_request = request.clone();
    let background_key = key.clone();

    tokio::spawn(async move {
      match network.fetch(&background_request).await {
        Ok(response) => {
          // Receiver is gone when a cached copy was already returned
          let _ = tx.send(Ok(response.clone()));
          registry
            .put_best_effort(&store, &background_key, &response)
            .await;
        }
        Err(e) => {
          debug!(url = background_key.url(), error = %e, "Revalidation failed");
          let _ = tx.send(Err(e.to_string()));
        }
      }
    });

    if let Some(entry) = cached {
      return Ok(Served::from_cache(entry));
    }

    match rx.await {
      Ok(Ok(response)) => Ok(Served::from_network(response)),
      Ok(Err(e)) => Err(eyre!("Cache miss for {} and network failed: {}", key.url(), e)),
      Err(_) => Err(eyre!("Cache miss for {} and revalidation was dropped", key.url())),
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      network: Arc::clone(&self.network),
      static_store: self.static_store.clone(),
      dynamic_store: self.dynamic_store.clone(),
    }
  }
}
