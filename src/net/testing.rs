//! Scripted network used by tests across the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::Semaphore;

use super::types::{AgentRequest, AgentResponse, Fetch};

/// A `Fetch` that answers from a per-URL script and counts calls.
///
/// URLs without a script entry fail like an unreachable network.
#[derive(Default)]
pub struct ScriptedFetch {
  script: Mutex<HashMap<String, Result<AgentResponse, String>>>,
  calls: AtomicUsize,
  gate: Option<Arc<Semaphore>>,
}

impl ScriptedFetch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every fetch waits for a permit on the returned semaphore before answering.
  pub fn gated() -> (Self, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let fetch = Self {
      gate: Some(Arc::clone(&gate)),
      ..Self::default()
    };
    (fetch, gate)
  }

  pub fn respond(self, url: &str, response: AgentResponse) -> Self {
    self.set(url, Ok(response));
    self
  }

  pub fn fail(self, url: &str) -> Self {
    self.set(url, Err("connection refused".to_string()));
    self
  }

  pub fn set(&self, url: &str, outcome: Result<AgentResponse, String>) {
    self
      .script
      .lock()
      .unwrap()
      .insert(url.to_string(), outcome);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetch for ScriptedFetch {
  async fn fetch(&self, request: &AgentRequest) -> Result<AgentResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if let Some(gate) = &self.gate {
      gate
        .acquire()
        .await
        .map_err(|e| eyre!("Gate closed: {}", e))?
        .forget();
    }

    let outcome = self
      .script
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();

    match outcome {
      Some(Ok(response)) => Ok(response),
      Some(Err(e)) => Err(eyre!("Failed to fetch {}: {}", request.url, e)),
      None => Err(eyre!("Failed to fetch {}: network unreachable", request.url)),
    }
  }
}
