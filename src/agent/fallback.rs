//! Last-resort responses when neither a strategy's network fetch nor its store lookup worked.

use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use super::classify::Classification;
use crate::cache::{CacheStorage, RequestKey, Served, StoreRegistry};
use crate::net::{AgentRequest, AgentResponse};

/// Offline fallback resolver. `resolve` never fails.
pub struct OfflineFallback<S: CacheStorage> {
  registry: StoreRegistry<S>,
  /// Path of the cached offline page, resolved against the request URL
  offline_page: String,
}

impl<S: CacheStorage + 'static> OfflineFallback<S> {
  pub fn new(registry: StoreRegistry<S>, offline_page: String) -> Self {
    Self {
      registry,
      offline_page,
    }
  }

  /// Best-effort response for a request nothing else could answer.
  ///
  /// 1. Any stored entry for the exact key
  /// 2. For navigations, the cached offline page
  /// 3. A synthesized 503 JSON payload
  pub async fn resolve(&self, request: &AgentRequest, classification: Classification) -> Served {
    let key = RequestKey::for_request(request);
    if let Some(served) = self.lookup(&key).await {
      return served;
    }

    if classification == Classification::Navigation {
      match request.url.join(&self.offline_page) {
        Ok(page) => {
          if let Some(served) = self.lookup(&RequestKey::get(&page)).await {
            debug!(url = %request.url, "Serving cached offline page");
            return served;
          }
        }
        Err(e) => warn!(page = %self.offline_page, error = %e, "Invalid offline page path"),
      }
    }

    debug!(url = %request.url, "Synthesizing offline response");
    Served::fallback(offline_response(&request.url))
  }

  async fn lookup(&self, key: &RequestKey) -> Option<Served> {
    match self.registry.match_any(key).await {
      Ok(entry) => entry.map(Served::from_cache),
      Err(e) => {
        warn!(url = key.url(), error = %e, "Store read failed during fallback");
        None
      }
    }
  }
}

/// The synthesized `503` returned when nothing is available offline.
pub fn offline_response(url: &Url) -> AgentResponse {
  let body = json!({
    "error": "offline",
    "message": format!("Network unavailable and no cached copy of {}", url),
    "offline": true,
  });

  AgentResponse::new(503, body.to_string()).with_header("content-type", "application/json")
}
