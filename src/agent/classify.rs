use std::collections::BTreeSet;

use crate::cache::Strategy;
use crate::config::Config;
use crate::net::AgentRequest;

/// Category of an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  Api,
  StaticAsset,
  Navigation,
  Other,
}

impl Classification {
  pub fn strategy(self) -> Strategy {
    match self {
      Self::Api | Self::Other => Strategy::NetworkFirst,
      Self::StaticAsset => Strategy::CacheFirst,
      Self::Navigation => Strategy::StaleWhileRevalidate,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Api => "api",
      Self::StaticAsset => "static",
      Self::Navigation => "navigation",
      Self::Other => "other",
    }
  }
}

/// Classification rules
#[derive(Debug, Clone)]
pub struct Classifier {
  api_prefixes: Vec<String>,
  static_extensions: BTreeSet<String>,
}

impl Classifier {
  pub fn new(api_prefixes: Vec<String>, static_extensions: BTreeSet<String>) -> Self {
    Self {
      api_prefixes,
      static_extensions,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(config.api_prefixes.clone(), config.static_extensions.clone())
  }

  /// Classify a request, or `None` when it must pass through untouched
  /// (non-http(s) scheme or non-GET method).
  pub fn classify(&self, request: &AgentRequest) -> Option<Classification> {
    if !matches!(request.url.scheme(), "http" | "https") || !request.is_get() {
      return None;
    }

    let path = request.url.path();

    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return Some(Classification::Api);
    }

    if let Some(ext) = extension(path) {
      if self.static_extensions.contains(&ext) {
        return Some(Classification::StaticAsset);
      }
    }

    let wants_html = request
      .accept
      .as_deref()
      .is_some_and(|accept| accept.to_ascii_lowercase().contains("text/html"));
    if wants_html {
      return Some(Classification::Navigation);
    }

    Some(Classification::Other)
  }
}

/// Lowercased extension of the last path segment
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn classifier() -> Classifier {
    Classifier::from_config(&Config::default())
  }

  fn get(url: &str) -> AgentRequest {
    AgentRequest::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_passes_through() {
    let request = AgentRequest::new("POST", Url::parse("https://example.com/api/chat").unwrap());
    assert_eq!(classifier().classify(&request), None);
  }

  #[test]
  fn test_non_http_scheme_passes_through() {
    assert_eq!(classifier().classify(&get("ws://example.com/socket")), None);
    assert_eq!(classifier().classify(&get("data:text/plain,hello")), None);
  }

  #[test]
  fn test_api_prefix() {
    assert_eq!(
      classifier().classify(&get("https://example.com/api/health")),
      Some(Classification::Api)
    );
    // API prefix wins over an asset-looking extension
    assert_eq!(
      classifier().classify(&get("https://example.com/api/export.js")),
      Some(Classification::Api)
    );
  }

  #[test]
  fn test_static_assets() {
    for url in [
      "https://example.com/static/css/main.css",
      "https://example.com/static/js/main.js",
      "https://example.com/img/logo.PNG",
      "https://example.com/fonts/inter.woff2?v=3",
    ] {
      assert_eq!(
        classifier().classify(&get(url)),
        Some(Classification::StaticAsset),
        "{}",
        url
      );
    }
  }

  #[test]
  fn test_navigation_by_accept() {
    let request = get("https://example.com/chat").with_accept("text/html,application/xhtml+xml");
    assert_eq!(classifier().classify(&request), Some(Classification::Navigation));
  }

  #[test]
  fn test_everything_else_is_other() {
    let request = get("https://example.com/manifest.json").with_accept("application/json");
    assert_eq!(classifier().classify(&request), Some(Classification::Other));
    assert_eq!(classifier().classify(&get("https://example.com/")), Some(Classification::Other));
  }

  #[test]
  fn test_strategy_mapping() {
    assert_eq!(Classification::Api.strategy(), Strategy::NetworkFirst);
    assert_eq!(Classification::Other.strategy(), Strategy::NetworkFirst);
    assert_eq!(Classification::StaticAsset.strategy(), Strategy::CacheFirst);
    assert_eq!(
      Classification::Navigation.strategy(),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_extension() {
    assert_eq!(extension("/a/b/style.CSS"), Some("css".to_string()));
    assert_eq!(extension("/a/b/"), None);
    assert_eq!(extension("/a/readme"), None);
    assert_eq!(extension("/archive.tar.gz"), Some("gz".to_string()));
  }
}
