//! Request and response types shared by the whole pipeline.

use async_trait::async_trait;
use color_eyre::Result;
use url::Url;

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
  pub method: String,
  pub url: Url,
  /// Accept hint, used to detect navigation intent
  pub accept: Option<String>,
  /// Headers to forward when the request goes to the network
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl AgentRequest {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      accept: None,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  /// A plain GET for `url`, as issued by precaching.
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_accept(mut self, accept: &str) -> Self {
    self.accept = Some(accept.to_string());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }
}

/// A response as captured from the network or read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl AgentResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// First header value matching `name`, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether the status is 2xx.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether the response may be stored: a complete 2xx. A `206` only
  /// covers a byte range and must never stand in for the full resource.
  pub fn is_cacheable(&self) -> bool {
    self.is_success() && self.status != 206
  }
}

/// Something that can put a request on the wire.
///
/// An `Err` means the network could not produce a response at all.
/// Any HTTP status, including 4xx/5xx, is a successful fetch.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &AgentRequest) -> Result<AgentResponse>;
}
