//! Local HTTP front that runs every request through the interception layer.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{ResponseSource, ResponseStore, SqliteResponseStore};
use crate::config::Config;
use crate::intercept::{
  is_hop_by_hop, HttpUpstream, InterceptRequest, InterceptScope, Interceptor, Served, Upstream,
};
use crate::lifecycle::{LifecycleController, LifecycleStatus};

/// Largest request body forwarded upstream (word imports are the big ones).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Response header naming where the response came from.
pub const SOURCE_HEADER: &str = "x-spellmaster-source";

pub struct ServerState<S: ResponseStore + 'static, U: Upstream> {
  pub interceptor: Interceptor<S, U>,
  pub lifecycle: Arc<LifecycleController<S, U>>,
  pub origin: Url,
}

/// Build the router: control endpoints under `/__spellmaster/`, everything else proxied.
pub fn router<S, U>(state: Arc<ServerState<S, U>>) -> Router
where
  S: ResponseStore + 'static,
  U: Upstream,
{
  Router::new()
    .route("/__spellmaster/message", post(control_message::<S, U>))
    .route("/__spellmaster/status", get(status::<S, U>))
    .route("/__spellmaster/events", get(events::<S, U>))
    .fallback(proxy::<S, U>)
    .with_state(state)
}

/// Run the offline front until Ctrl-C.
pub async fn run(config: &Config, data_dir: &std::path::Path) -> Result<()> {
  let store = Arc::new(SqliteResponseStore::open(
    &SqliteResponseStore::default_path(data_dir),
  )?);
  let upstream = Arc::new(HttpUpstream::new(config)?);
  let origin = Url::parse(&config.origin)
    .map_err(|e| eyre!("Invalid origin URL {}: {}", config.origin, e))?;

  let lifecycle = Arc::new(LifecycleController::new(
    Arc::clone(&store),
    Arc::clone(&upstream),
    origin.clone(),
    &config.cache,
  )?);

  // Install in the background so the front also comes up while offline.
  {
    let lifecycle = Arc::clone(&lifecycle);
    let tag = config.cache.generation.clone();
    tokio::spawn(async move {
      if let Err(e) = lifecycle.register(&tag).await {
        warn!(generation = %tag, error = %e, "generation install failed");
      }
    });
  }

  let interceptor = Interceptor::new(
    store,
    upstream,
    InterceptScope::from_config(config),
    lifecycle.generation_watch(),
  );
  let state = Arc::new(ServerState {
    interceptor,
    lifecycle,
    origin,
  });

  let listener = tokio::net::TcpListener::bind(&config.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.listen, e))?;
  info!(listen = %config.listen, origin = %config.origin, "offline front listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for Ctrl-C");
    std::future::pending::<()>().await;
  }
  info!("shutting down");
}

async fn proxy<S, U>(State(state): State<Arc<ServerState<S, U>>>, request: Request) -> Response
where
  S: ResponseStore + 'static,
  U: Upstream,
{
  let (parts, body) = request.into_parts();
  let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => {
      warn!(error = %e, "failed to read request body");
      return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
  };

  let mut url = state.origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  // Let the client library negotiate encodings so cached bodies are stored decoded.
  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| *name != axum::http::header::ACCEPT_ENCODING)
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let request = InterceptRequest::new(parts.method.as_str(), url, headers, body);
  match state.interceptor.handle(request).await {
    Ok(served) => into_response(served),
    Err(e) => {
      warn!(error = %e, "upstream request failed");
      StatusCode::BAD_GATEWAY.into_response()
    }
  }
}

fn source_label(source: ResponseSource) -> &'static str {
  match source {
    ResponseSource::Network => "network",
    ResponseSource::Cache => "cache",
    ResponseSource::OfflineFallback => "offline-fallback",
    ResponseSource::Unavailable => "unavailable",
    ResponseSource::Passthrough => "passthrough",
  }
}

fn into_response(served: Served) -> Response {
  let mut builder = axum::http::Response::builder().status(served.response.status);
  for (name, value) in &served.response.headers {
    if !is_hop_by_hop(name) {
      builder = builder.header(name, value);
    }
  }
  builder = builder.header(SOURCE_HEADER, source_label(served.source));

  builder
    .body(Body::from(served.response.body))
    .unwrap_or_else(|e| {
      warn!(error = %e, "failed to build response");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

async fn control_message<S, U>(
  State(state): State<Arc<ServerState<S, U>>>,
  message: String,
) -> Result<Json<serde_json::Value>, StatusCode>
where
  S: ResponseStore + 'static,
  U: Upstream,
{
  match state.lifecycle.on_control_message(&message).await {
    Ok(applied) => Ok(Json(serde_json::json!({ "applied": applied }))),
    Err(e) => {
      warn!(error = %e, "control message failed");
      Err(StatusCode::INTERNAL_SERVER_ERROR)
    }
  }
}

async fn status<S, U>(
  State(state): State<Arc<ServerState<S, U>>>,
) -> Result<Json<LifecycleStatus>, StatusCode>
where
  S: ResponseStore + 'static,
  U: Upstream,
{
  state.lifecycle.status().map(Json).map_err(|e| {
    warn!(error = %e, "failed to read lifecycle status");
    StatusCode::INTERNAL_SERVER_ERROR
  })
}

/// Lifecycle events as server-sent events; clients reload on `controllerchange`.
async fn events<S, U>(
  State(state): State<Arc<ServerState<S, U>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
  S: ResponseStore + 'static,
  U: Upstream,
{
  let stream = futures::stream::unfold(state.lifecycle.subscribe(), |mut events| async move {
    events.next().await.map(|event| {
      let sse = Event::default().event(event.name()).data(event.generation());
      (Ok(sse), events)
    })
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{HttpResponse, RequestKey};
  use crate::config::CacheConfig;
  use crate::intercept::tests::{page, url, MockUpstream};
  use crate::lifecycle::SKIP_WAITING;

  struct TestServer {
    base: String,
    store: Arc<SqliteResponseStore>,
    upstream: Arc<MockUpstream>,
    lifecycle: Arc<LifecycleController<SqliteResponseStore, MockUpstream>>,
  }

  async fn start() -> TestServer {
    let store = Arc::new(SqliteResponseStore::open_in_memory().unwrap());
    let upstream = Arc::new(MockUpstream::default());
    for path in ["/", "/practice", "/login", "/register", "/offline"] {
      upstream.serve(path, page("shell"));
    }
    let config = Config {
      cache: CacheConfig {
        skip_waiting: false,
        ..CacheConfig::default()
      },
      ..Config::default()
    };
    let lifecycle = Arc::new(
      LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&upstream),
        url("/"),
        &config.cache,
      )
      .unwrap(),
    );
    lifecycle.register("spellmaster-v1").await.unwrap();

    let interceptor = Interceptor::new(
      Arc::clone(&store),
      Arc::clone(&upstream),
      InterceptScope::from_config(&config),
      lifecycle.generation_watch(),
    );
    let state = Arc::new(ServerState {
      interceptor,
      lifecycle: Arc::clone(&lifecycle),
      origin: url("/"),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer {
      base: format!("http://{}", addr),
      store,
      upstream,
      lifecycle,
    }
  }

  #[tokio::test]
  async fn test_offline_navigation_served_from_cache() {
    let server = start().await;
    server.upstream.set_offline(true);
    let client = reqwest::Client::new();

    let practice = client
      .get(format!("{}/practice", server.base))
      .header("sec-fetch-mode", "navigate")
      .send()
      .await
      .unwrap();
    assert_eq!(practice.status(), 200);
    assert_eq!(practice.headers()[SOURCE_HEADER], "cache");
    assert_eq!(practice.text().await.unwrap(), "shell");

    let settings = client
      .get(format!("{}/settings", server.base))
      .header("sec-fetch-mode", "navigate")
      .send()
      .await
      .unwrap();
    assert_eq!(settings.status(), 200);
    assert_eq!(settings.headers()[SOURCE_HEADER], "offline-fallback");

    let words = client
      .get(format!("{}/api/words?limit=5", server.base))
      .send()
      .await
      .unwrap();
    assert_eq!(words.status(), 503);
  }

  #[tokio::test]
  async fn test_passthrough_failure_is_bad_gateway() {
    let server = start().await;
    server.upstream.set_offline(true);

    let response = reqwest::get(format!("{}/api/auth/me", server.base))
      .await
      .unwrap();
    assert_eq!(response.status(), 502);
  }

  #[tokio::test]
  async fn test_words_api_cached_with_query() {
    let server = start().await;
    server.upstream.serve(
      "/api/words?difficulty=easy",
      HttpResponse::new(
        200,
        vec![("content-type".to_string(), "application/json".to_string())],
        r#"{"words":[],"total":0}"#,
      ),
    );

    let response = reqwest::get(format!("{}/api/words?difficulty=easy", server.base))
      .await
      .unwrap();
    assert_eq!(response.headers()[SOURCE_HEADER], "network");
    assert!(server
      .store
      .match_in(
        "spellmaster-v1",
        &RequestKey::get(&url("/api/words?difficulty=easy"))
      )
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_control_message_promotes_waiting_generation() {
    let server = start().await;
    server.lifecycle.register("spellmaster-v2").await.unwrap();
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
      .get(format!("{}/__spellmaster/status", server.base))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert_eq!(status["waiting"], "spellmaster-v2");
    assert_eq!(status["update_available"], true);

    let reply: serde_json::Value = client
      .post(format!("{}/__spellmaster/message", server.base))
      .body(SKIP_WAITING)
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert_eq!(reply["applied"], true);
    assert_eq!(server.store.list_names().unwrap(), vec!["spellmaster-v2"]);

    let status: serde_json::Value = client
      .get(format!("{}/__spellmaster/status", server.base))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert_eq!(status["active"], "spellmaster-v2");
    assert_eq!(status["waiting"], serde_json::Value::Null);
    assert_eq!(status["update_available"], false);
  }
}
