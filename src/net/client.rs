use crate::config::Config;
use crate::net::types::{AgentRequest, AgentResponse, Fetch};
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use std::time::Duration;

/// Headers that only make sense for a single hop and are never forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// HTTP client used for every network fetch the agent makes
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .user_agent(concat!("stowaway/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetch for HttpClient {
  async fn fetch(&self, request: &AgentRequest) -> Result<AgentResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
      if is_hop_by_hop(name) {
        continue;
      }
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }
    if let Some(accept) = &request.accept {
      if !headers.contains_key(ACCEPT) {
        if let Ok(value) = HeaderValue::from_str(accept) {
          headers.insert(ACCEPT, value);
        }
      }
    }

    let mut builder = self
      .client
      .request(method, request.url.clone())
      .headers(headers);
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?;

    Ok(AgentResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hop_by_hop_headers() {
    assert!(is_hop_by_hop("Connection"));
    assert!(is_hop_by_hop("transfer-encoding"));
    assert!(is_hop_by_hop("Host"));
    assert!(!is_hop_by_hop("content-type"));
    assert!(!is_hop_by_hop("etag"));
  }

  #[tokio::test]
  async fn test_unreachable_host_is_a_network_failure() {
    let config = Config {
      request_timeout_secs: 2,
      ..Config::default()
    };
    let client = HttpClient::new(&config).unwrap();
    // Port 9 (discard) on localhost is expected to refuse connections
    let url = url::Url::parse("http://127.0.0.1:9/").unwrap();
    let result = client.fetch(&AgentRequest::get(url)).await;
    assert!(result.is_err());
  }
}
