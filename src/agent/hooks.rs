//! Background-sync and push hooks. Peripheral to caching.

use serde::Serialize;
use tracing::{debug, info};

use super::lifecycle::PrecacheReport;
use super::Agent;
use crate::cache::CacheStorage;

const DEFAULT_PUSH_BODY: &str = "New content is available";

/// A notification to show for a push delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
}

impl<S: CacheStorage + 'static> Agent<S> {
  /// Handle a background-sync event by refreshing the precached resources.
  ///
  /// Returns `None` for tags this agent does not own.
  pub async fn on_sync(&self, tag: &str) -> Option<PrecacheReport> {
    if tag != self.config.sync_tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return None;
    }

    info!(tag, "Background sync");
    Some(self.lifecycle.precache().await)
  }

  pub fn on_push(&self, payload: &str) -> Notification {
    let body = payload.trim();
    Notification {
      title: self.config.app_name.clone(),
      body: if body.is_empty() {
        DEFAULT_PUSH_BODY.to_string()
      } else {
        body.to_string()
      },
    }
  }
}
