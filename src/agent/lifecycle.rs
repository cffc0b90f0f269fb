//! Agent lifecycle: install, activation and control messages.
//!
//! ```text
//! installing -> waiting -> activating -> active
//!        \__________\___________\__________\__> redundant
//! ```
//!
//! The agent only controls (serves) requests while `active`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey, StoreRegistry};
use crate::config::Config;
use crate::net::{AgentRequest, Fetch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Active,
  /// Superseded; never controls requests again
  Redundant,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

/// Message sent to the agent by the hosting application
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  GetVersion,
  #[serde(other)]
  Unknown,
}

/// Reply sent back over a control message's reply channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  Version { version: String },
}

/// Outcome of loading the precache manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrecacheReport {
  pub cached: Vec<String>,
  pub failed: Vec<PrecacheFailed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecacheFailed {
  pub path: String,
  pub reason: &'static str,
}

/// Why one manifest entry could not be precached
#[derive(Debug)]
enum PrecacheFailure {
  InvalidUrl(String),
  Network(String),
  HttpStatus(u16),
  Storage(String),
}

impl PrecacheFailure {
  fn reason(&self) -> &'static str {
    match self {
      Self::InvalidUrl(_) => "invalid_url",
      Self::Network(_) => "network",
      Self::HttpStatus(_) => "http_status",
      Self::Storage(_) => "storage",
    }
  }
}

impl fmt::Display for PrecacheFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::InvalidUrl(e) => write!(f, "invalid URL: {}", e),
      Self::Network(e) => write!(f, "network error: {}", e),
      Self::HttpStatus(status) => write!(f, "unexpected status {}", status),
      Self::Storage(e) => write!(f, "store write failed: {}", e),
    }
  }
}

/// Drives the agent through its lifecycle and owns the version whitelist.
pub struct Lifecycle<S: CacheStorage> {
  registry: StoreRegistry<S>,
  network: Arc<dyn Fetch>,
  config: Arc<Config>,
  origin: Url,
  skip_waiting: AtomicBool,
  /// Set by the first `install`; later calls are no-ops
  install_claimed: AtomicBool,
  state: watch::Sender<LifecycleState>,
}

impl<S: CacheStorage + 'static> Lifecycle<S> {
  pub fn new(
    registry: StoreRegistry<S>,
    network: Arc<dyn Fetch>,
    config: Arc<Config>,
    origin: Url,
  ) -> Self {
    let (state, _) = watch::channel(LifecycleState::Installing);
    Self {
      registry,
      network,
      skip_waiting: AtomicBool::new(config.skip_waiting),
      install_claimed: AtomicBool::new(false),
      config,
      origin,
      state,
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  /// Watch state transitions.
  pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.state.subscribe()
  }

  /// Whether intercepted requests are currently handled by the agent.
  pub fn is_controlling(&self) -> bool {
    self.state() == LifecycleState::Active
  }

  /// Identifier of the current version whitelist.
  pub fn version(&self) -> String {
    self.config.version_id()
  }

  /// Move to `to` only if the current state is one of `from`.
  fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
    self.state.send_if_modified(|state| {
      if from.contains(state) {
        debug!(from = state.as_str(), to = to.as_str(), "Lifecycle transition");
        *state = to;
        true
      } else {
        false
      }
    })
  }

  /// Precache the manifest, then wait (or activate straight away when
  /// skip-waiting was requested).
  ///
  /// Precache failures never fail the install.
  pub async fn install(&self) -> PrecacheReport {
    if self.install_claimed.swap(true, Ordering::SeqCst)
      || self.state() != LifecycleState::Installing
    {
      debug!(state = self.state().as_str(), "Install skipped");
      return PrecacheReport::default();
    }

    info!(version = %self.version(), "Installing");
    let report = self.precache().await;

    if self.transition(&[LifecycleState::Installing], LifecycleState::Waiting)
      && self.skip_waiting.load(Ordering::SeqCst)
    {
      self.activate().await;
    }

    report
  }

  /// Load every manifest resource into the static store.
  pub async fn precache(&self) -> PrecacheReport {
    let store = self.config.static_store();
    if let Err(e) = self.registry.open(&store).await {
      warn!(store = %store, error = %e, "Failed to open static store");
    }

    let store_name = &store;
    let results = join_all(
      self
        .config
        .precache
        .iter()
        .map(|path| async move { (path, self.precache_one(store_name, path).await) }),
    )
    .await;

    let mut report = PrecacheReport::default();
    for (path, result) in results {
      match result {
        Ok(()) => report.cached.push(path.clone()),
        Err(failure) => {
          warn!(path = %path, reason = failure.reason(), "Precache failed: {}", failure);
          report.failed.push(PrecacheFailed {
            path: path.clone(),
            reason: failure.reason(),
          });
        }
      }
    }

    info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Precache complete"
    );
    report
  }

  async fn precache_one(&self, store: &str, path: &str) -> Result<(), PrecacheFailure> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| PrecacheFailure::InvalidUrl(e.to_string()))?;
    let request = AgentRequest::get(url);

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| PrecacheFailure::Network(e.to_string()))?;
    if !response.is_cacheable() {
      return Err(PrecacheFailure::HttpStatus(response.status));
    }

    self
      .registry
      .put(store, &RequestKey::for_request(&request), &response)
      .await
      .map_err(|e| PrecacheFailure::Storage(e.to_string()))?;

    Ok(())
  }

  /// Activate from `waiting`: delete stale stores, then start controlling.
  ///
  /// Returns the deleted store names, or `None` when the agent was not waiting.
  pub async fn activate(&self) -> Option<Vec<String>> {
    if !self.transition(&[LifecycleState::Waiting], LifecycleState::Activating) {
      debug!(state = self.state().as_str(), "Activation skipped");
      return None;
    }

    let whitelist = self.config.whitelist();
    let deleted = match self.registry.reconcile(&whitelist).await {
      Ok(deleted) => deleted,
      Err(e) => {
        // Nothing was deleted, so nothing can be served from a doomed store
        warn!(error = %e, "Failed to enumerate stores during activation");
        Vec::new()
      }
    };

    // Claim only once cleanup is done
    if self.transition(&[LifecycleState::Activating], LifecycleState::Active) {
      info!(
        version = %self.version(),
        deleted = deleted.len(),
        "Active; controlling requests"
      );
    }

    Some(deleted)
  }

  /// Request activation without waiting.
  ///
  /// During install this takes effect once install completes.
  pub async fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
    if self.state() == LifecycleState::Waiting {
      self.activate().await;
    }
  }

  /// Mark this instance as superseded. It stops controlling requests.
  pub fn supersede(&self) {
    let previous = self.state.send_replace(LifecycleState::Redundant);
    if previous != LifecycleState::Redundant {
      info!(from = previous.as_str(), "Superseded; now redundant");
    }
  }

  pub async fn handle_message(
    &self,
    message: ControlMessage,
    reply: Option<oneshot::Sender<ControlReply>>,
  ) {
    match message {
      ControlMessage::SkipWaiting => self.skip_waiting().await,
      ControlMessage::GetVersion => {
        let version = ControlReply::Version {
          version: self.version(),
        };
        match reply {
          Some(tx) => {
            if tx.send(version).is_err() {
              debug!("Version reply channel closed");
            }
          }
          None => debug!("GET_VERSION without a reply channel"),
        }
      }
      ControlMessage::Unknown => debug!("Ignoring unrecognized control message"),
    }
  }
}
