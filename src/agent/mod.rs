//! The caching agent: per-request pipeline plus lifecycle.
//!
//! Every intercepted request runs, in order, through the controlling check,
//! the classifier, the selected strategy and, if the strategy fails, the
//! offline fallback. Requests are handled concurrently with no shared lock;
//! the stores are the only shared state (last writer wins per key).

mod classify;
mod fallback;
mod hooks;
mod lifecycle;

pub use classify::Classifier;
pub use fallback::OfflineFallback;
pub use lifecycle::{ControlMessage, ControlReply, Lifecycle, LifecycleState, PrecacheReport};

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::cache::{CacheLayer, CacheStorage, Served, StoreRegistry};
use crate::config::Config;
use crate::net::{AgentRequest, Fetch};

/// What the agent decided to do with an intercepted request
#[derive(Debug)]
pub enum FetchOutcome {
  /// The agent does not participate; the request goes to the network untouched
  PassThrough,
  Respond(Served),
}

pub struct Agent<S: CacheStorage> {
  config: Arc<Config>,
  registry: StoreRegistry<S>,
  classifier: Classifier,
  layer: CacheLayer<S>,
  fallback: OfflineFallback<S>,
  lifecycle: Lifecycle<S>,
}

impl<S: CacheStorage + 'static> Agent<S> {
  pub fn new(config: Arc<Config>, storage: S, network: Arc<dyn Fetch>) -> Result<Self> {
    let origin = config.origin_url()?;
    let registry = StoreRegistry::new(storage);

    Ok(Self {
      classifier: Classifier::from_config(&config),
      layer: CacheLayer::new(
        registry.clone(),
        Arc::clone(&network),
        config.static_store(),
        config.dynamic_store(),
      ),
      fallback: OfflineFallback::new(registry.clone(), config.offline_page.clone()),
      lifecycle: Lifecycle::new(registry.clone(), network, Arc::clone(&config), origin),
      registry,
      config,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn registry(&self) -> &StoreRegistry<S> {
    &self.registry
  }

  pub fn lifecycle(&self) -> &Lifecycle<S> {
    &self.lifecycle
  }

  pub async fn install(&self) -> PrecacheReport {
    self.lifecycle.install().await
  }

  /// Handle one intercepted request.
  pub async fn handle_fetch(&self, request: &AgentRequest) -> FetchOutcome {
    if !self.lifecycle.is_controlling() {
      trace!(url = %request.url, state = self.lifecycle.state().as_str(), "Not controlling");
      return FetchOutcome::PassThrough;
    }

    let Some(classification) = self.classifier.classify(request) else {
      trace!(method = %request.method, url = %request.url, "Passing through");
      return FetchOutcome::PassThrough;
    };

    let served = match self
      .layer
      .execute(classification.strategy(), request)
      .await
    {
      Ok(served) => served,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Strategy failed; resolving fallback");
        self.fallback.resolve(request, classification).await
      }
    };

    debug!(
      url = %request.url,
      class = classification.as_str(),
      source = served.source.as_str(),
      status = served.response.status,
      "Served"
    );
    FetchOutcome::Respond(served)
  }

  pub async fn handle_message(
    &self,
    message: ControlMessage,
    reply: Option<oneshot::Sender<ControlReply>>,
  ) {
    self.lifecycle.handle_message(message, reply).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedEntry, RequestKey, ResponseSource, SqliteStorage};
  use crate::net::testing::ScriptedFetch;
  use crate::net::AgentResponse;
  use color_eyre::eyre::eyre;
  use serde_json::Value;
  use std::sync::mpsc;
  use std::sync::Mutex;
  use std::time::Duration;
  use url::Url;

  fn config() -> Arc<Config> {
    Arc::new(Config {
      origin: "https://example.com".to_string(),
      cache_prefix: "app".to_string(),
      version: "v2".to_string(),
      precache: Vec::new(),
      ..Config::default()
    })
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://example.com{}", path)).unwrap()
  }

  async fn active_agent(network: Arc<ScriptedFetch>) -> Agent<SqliteStorage> {
    let agent = Agent::new(config(), SqliteStorage::open_in_memory().unwrap(), network).unwrap();
    agent.install().await;
    assert!(agent.lifecycle().is_controlling());
    agent
  }

  fn served(outcome: FetchOutcome) -> Served {
    match outcome {
      FetchOutcome::Respond(served) => served,
      FetchOutcome::PassThrough => panic!("expected the agent to respond"),
    }
  }

  #[tokio::test]
  async fn test_static_asset_hit_issues_no_network_call() {
    let network = Arc::new(ScriptedFetch::new());
    let agent = active_agent(Arc::clone(&network)).await;
    let request = AgentRequest::get(url("/static/css/main.css"));
    agent
      .registry()
      .put(
        "app-static-v2",
        &RequestKey::for_request(&request),
        &AgentResponse::new(200, "css"),
      )
      .await
      .unwrap();

    let served = served(agent.handle_fetch(&request).await);
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_api_success_lands_in_dynamic_store() {
    let network = Arc::new(
      ScriptedFetch::new().respond("https://example.com/api/explain", AgentResponse::new(200, "ok")),
    );
    let agent = active_agent(network).await;
    let request = AgentRequest::get(url("/api/explain"));

    let served = served(agent.handle_fetch(&request).await);
    assert_eq!(served.source, ResponseSource::Network);

    let entry = agent
      .registry()
      .get("app-dynamic-v2", &RequestKey::for_request(&request))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body, b"ok".to_vec());
  }

  #[tokio::test]
  async fn test_total_miss_yields_offline_503() {
    let agent = active_agent(Arc::new(ScriptedFetch::new())).await;

    for request in [
      AgentRequest::get(url("/api/explain")),
      AgentRequest::get(url("/static/js/main.js")),
      AgentRequest::get(url("/chat")).with_accept("text/html"),
    ] {
      let served = served(agent.handle_fetch(&request).await);
      assert_eq!(served.source, ResponseSource::Fallback);
      assert_eq!(served.response.status, 503);
      let body: Value = serde_json::from_slice(&served.response.body).unwrap();
      assert_eq!(body["offline"], Value::Bool(true));
    }
  }

  #[tokio::test]
  async fn test_navigation_cache_miss_falls_back_to_offline_page() {
    let agent = active_agent(Arc::new(ScriptedFetch::new())).await;
    agent
      .registry()
      .put(
        "app-static-v2",
        &RequestKey::get(&url("/offline.html")),
        &AgentResponse::new(200, "offline page"),
      )
      .await
      .unwrap();

    let request = AgentRequest::get(url("/history")).with_accept("text/html");
    let served = served(agent.handle_fetch(&request).await);
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"offline page".to_vec());
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let network = Arc::new(ScriptedFetch::new());
    let agent = active_agent(Arc::clone(&network)).await;
    let request = AgentRequest::new("POST", url("/api/explain"));

    assert!(matches!(
      agent.handle_fetch(&request).await,
      FetchOutcome::PassThrough
    ));
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_waiting_agent_passes_through() {
    let config = Arc::new(Config {
      skip_waiting: false,
      ..(*config()).clone()
    });
    let agent = Agent::new(
      config,
      SqliteStorage::open_in_memory().unwrap(),
      Arc::new(ScriptedFetch::new()),
    )
    .unwrap();
    agent.install().await;

    let request = AgentRequest::get(url("/api/explain"));
    assert!(matches!(
      agent.handle_fetch(&request).await,
      FetchOutcome::PassThrough
    ));
  }

  /// Storage whose store deletions block until the test releases them.
  struct GatedStorage {
    inner: SqliteStorage,
    release: Mutex<mpsc::Receiver<()>>,
  }

  impl CacheStorage for GatedStorage {
    fn open_store(&self, name: &str) -> Result<()> {
      self.inner.open_store(name)
    }

    fn get_entry(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.inner.get_entry(store, key)
    }

    fn put_entry(&self, store: &str, key: &RequestKey, response: &AgentResponse) -> Result<()> {
      self.inner.put_entry(store, key, response)
    }

    fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.inner.match_any(key)
    }

    fn store_names(&self) -> Result<Vec<String>> {
      self.inner.store_names()
    }

    fn delete_store(&self, name: &str) -> Result<bool> {
      let _ = self.release.lock().unwrap().recv();
      self.inner.delete_store(name)
    }
  }

  /// Storage whose every operation fails, like an unreadable disk.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn open_store(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }

    fn get_entry(&self, _store: &str, _key: &RequestKey) -> Result<Option<CachedEntry>> {
      Err(eyre!("disk unavailable"))
    }

    fn put_entry(&self, _store: &str, _key: &RequestKey, _response: &AgentResponse) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }

    fn match_any(&self, _key: &RequestKey) -> Result<Option<CachedEntry>> {
      Err(eyre!("disk unavailable"))
    }

    fn store_names(&self) -> Result<Vec<String>> {
      Err(eyre!("disk unavailable"))
    }

    fn delete_store(&self, _name: &str) -> Result<bool> {
      Err(eyre!("disk unavailable"))
    }
  }

  #[tokio::test]
  async fn test_store_failures_never_fail_a_request() {
    let network = Arc::new(
      ScriptedFetch::new()
        .respond("https://example.com/api/explain", AgentResponse::new(200, "api"))
        .respond("https://example.com/static/js/main.js", AgentResponse::new(200, "js"))
        .respond("https://example.com/chat", AgentResponse::new(200, "<html>")),
    );
    let agent = Agent::new(config(), BrokenStorage, Arc::clone(&network) as Arc<dyn Fetch>).unwrap();
    agent.install().await;
    assert!(agent.lifecycle().is_controlling());

    // Network-first, cache-first and stale-while-revalidate all return the network answer
    for (request, body) in [
      (AgentRequest::get(url("/api/explain")), "api"),
      (AgentRequest::get(url("/static/js/main.js")), "js"),
      (AgentRequest::get(url("/chat")).with_accept("text/html"), "<html>"),
    ] {
      let served = served(agent.handle_fetch(&request).await);
      assert_eq!(served.source, ResponseSource::Network);
      assert_eq!(served.response.status, 200);
      assert_eq!(served.response.body, body.as_bytes().to_vec());
    }

    // Unreadable stores count as a miss, so a failed fetch still reaches the 503
    let served = served(agent.handle_fetch(&AgentRequest::get(url("/api/other"))).await);
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_no_requests_served_until_stale_stores_are_deleted() {
    let (release, gate) = mpsc::channel();
    let storage = GatedStorage {
      inner: SqliteStorage::open_in_memory().unwrap(),
      release: Mutex::new(gate),
    };
    let config = Arc::new(Config {
      skip_waiting: false,
      ..(*config()).clone()
    });
    let network = Arc::new(
      ScriptedFetch::new().respond("https://example.com/api/explain", AgentResponse::new(200, "ok")),
    );
    let agent = Arc::new(Agent::new(config, storage, network).unwrap());
    for name in ["app-static-v2", "app-dynamic-v2", "app-static-v1"] {
      agent.registry().open(name).await.unwrap();
    }
    agent.install().await;

    let activation = tokio::spawn({
      let agent = Arc::clone(&agent);
      async move { agent.lifecycle().activate().await }
    });

    for _ in 0..100 {
      if agent.lifecycle().state() == LifecycleState::Activating {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(agent.lifecycle().state(), LifecycleState::Activating);

    let request = AgentRequest::get(url("/api/explain"));
    assert!(matches!(
      agent.handle_fetch(&request).await,
      FetchOutcome::PassThrough
    ));

    release.send(()).unwrap();
    let deleted = activation.await.unwrap().unwrap();

    assert_eq!(deleted, vec!["app-static-v1".to_string()]);
    assert_eq!(
      agent.registry().list_names().await.unwrap(),
      vec!["app-static-v2".to_string(), "app-dynamic-v2".to_string()]
    );
    assert!(matches!(
      agent.handle_fetch(&request).await,
      FetchOutcome::Respond(_)
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_get_version_replies_once_during_request_traffic() {
    let (network, gate) = ScriptedFetch::gated();
    let agent = Arc::new(active_agent(Arc::new(network)).await);

    // Requests parked on the network while the message is handled
    let in_flight: Vec<_> = (0..8)
      .map(|i| {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
          let request = AgentRequest::get(url(&format!("/api/item/{}", i)));
          agent.handle_fetch(&request).await
        })
      })
      .collect();

    let (tx, mut rx) = oneshot::channel();
    agent.handle_message(ControlMessage::GetVersion, Some(tx)).await;
    let reply = tokio::time::timeout(Duration::from_secs(1), &mut rx)
      .await
      .expect("reply blocked behind request handling")
      .unwrap();
    assert_eq!(
      reply,
      ControlReply::Version {
        version: "app-v2".to_string()
      }
    );

    gate.add_permits(in_flight.len());
    for handle in in_flight {
      let served = served(handle.await.unwrap());
      assert_eq!(served.response.status, 503);
    }
  }
}
