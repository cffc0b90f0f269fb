//! HTTP host for the agent.
//!
//! Every request the client application sends here is resolved against the
//! configured origin and run through the agent. Control endpoints live under
//! `/__stowaway/`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
  body::{Body, Bytes},
  extract::{Request, State},
  http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};
use url::Url;

use crate::agent::{Agent, ControlMessage, FetchOutcome};
use crate::cache::{CacheStorage, ResponseSource};
use crate::net::{is_hop_by_hop, AgentRequest, AgentResponse, Fetch};

/// Response header naming where a served response came from
pub const SOURCE_HEADER: &str = "x-stowaway-source";

/// Largest body buffered on a GET the agent may intercept. Other methods
/// always pass through and are forwarded whatever their size.
const MAX_INTERCEPTED_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct ServerState<S: CacheStorage> {
  pub agent: Arc<Agent<S>>,
  /// Used for requests the agent passes through
  pub network: Arc<dyn Fetch>,
  pub origin: Url,
}

impl<S: CacheStorage> Clone for ServerState<S> {
  fn clone(&self) -> Self {
    Self {
      agent: Arc::clone(&self.agent),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
    }
  }
}

pub fn router<S: CacheStorage + 'static>(state: ServerState<S>) -> Router {
  Router::new()
    .route("/__stowaway/message", post(control_message::<S>))
    .route("/__stowaway/sync", post(background_sync::<S>))
    .route("/__stowaway/push", post(push::<S>))
    .route("/__stowaway/state", get(agent_state::<S>))
    .fallback(intercept::<S>)
    .with_state(state)
}

/// Install the agent, then serve until ctrl-c.
pub async fn serve<S: CacheStorage + 'static>(state: ServerState<S>, listen: &str) -> Result<()> {
  let addr: SocketAddr = listen
    .parse()
    .map_err(|e| eyre!("Invalid listen address '{}': {}", listen, e))?;

  let report = state.agent.install().await;
  info!(
    cached = report.cached.len(),
    failed = report.failed.len(),
    state = state.agent.lifecycle().state().as_str(),
    "Installed"
  );

  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
  info!(%addr, origin = %state.origin, "Listening");

  let agent = Arc::clone(&state.agent);
  axum::serve(listener, router(state))
    .with_graceful_shutdown(async move {
      let _ = tokio::signal::ctrl_c().await;
      agent.lifecycle().supersede();
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}

async fn control_message<S: CacheStorage + 'static>(
  State(state): State<ServerState<S>>,
  body: Bytes,
) -> Response {
  // Anything unparseable is just another unrecognized message
  let message = serde_json::from_slice(&body).unwrap_or(ControlMessage::Unknown);

  let (tx, rx) = oneshot::channel();
  state.agent.handle_message(message, Some(tx)).await;

  match rx.await {
    Ok(reply) => Json(reply).into_response(),
    Err(_) => StatusCode::ACCEPTED.into_response(),
  }
}

#[derive(Deserialize)]
struct SyncRequest {
  tag: String,
}

async fn background_sync<S: CacheStorage + 'static>(
  State(state): State<ServerState<S>>,
  Json(request): Json<SyncRequest>,
) -> Response {
  match state.agent.on_sync(&request.tag).await {
    Some(report) => Json(report).into_response(),
    None => StatusCode::NO_CONTENT.into_response(),
  }
}

async fn push<S: CacheStorage + 'static>(
  State(state): State<ServerState<S>>,
  payload: String,
) -> Response {
  Json(state.agent.on_push(&payload)).into_response()
}

#[derive(Serialize)]
struct StateView {
  state: &'static str,
  version: String,
}

async fn agent_state<S: CacheStorage + 'static>(State(state): State<ServerState<S>>) -> Response {
  let lifecycle = state.agent.lifecycle();
  Json(StateView {
    state: lifecycle.state().as_str(),
    version: lifecycle.version(),
  })
  .into_response()
}

async fn intercept<S: CacheStorage + 'static>(
  State(state): State<ServerState<S>>,
  request: Request,
) -> Response {
  let request = match into_agent_request(&state.origin, request).await {
    Ok(request) => request,
    Err(e) => {
      warn!(error = %e, "Rejected request");
      return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
  };

  match state.agent.handle_fetch(&request).await {
    FetchOutcome::Respond(served) => into_http_response(served.response, Some(served.source)),
    FetchOutcome::PassThrough => match state.network.fetch(&request).await {
      Ok(response) => into_http_response(response, None),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Pass-through request failed");
        (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
      }
    },
  }
}

/// Rebuild an incoming request against the origin.
async fn into_agent_request(origin: &Url, request: Request) -> Result<AgentRequest> {
  let (parts, body) = request.into_parts();

  // Path and query only; never let the request pick another host
  let mut url = origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let accept = parts
    .headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .map(String::from);

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let limit = if parts.method == Method::GET {
    MAX_INTERCEPTED_BODY_BYTES
  } else {
    usize::MAX
  };
  let body = axum::body::to_bytes(body, limit)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  let mut request = AgentRequest::new(parts.method.as_str(), url);
  request.accept = accept;
  request.headers = headers;
  request.body = body.to_vec();
  Ok(request)
}

fn into_http_response(response: AgentResponse, source: Option<ResponseSource>) -> Response {
  let mut headers = HeaderMap::new();
  for (name, value) in &response.headers {
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
  if let Some(source) = source {
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  }

  let mut http = Response::new(Body::from(response.body));
  *http.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  *http.headers_mut() = headers;
  http
}
