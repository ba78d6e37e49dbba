//! Interception layer: stale-while-revalidate between the client and the network.
//!
//! Every GET outside the API prefix (plus the words API) is answered from the
//! response cache when possible. A cache hit is returned immediately and
//! refreshed in the background; a miss goes to the network and is cached on
//! success; a miss while offline resolves to the offline page (navigations)
//! or a synthetic 503. Intercepted requests always resolve to a response.

mod network;

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{HttpResponse, RequestKey, ResponseSource, ResponseStore};
use crate::config::Config;

pub use network::{is_hop_by_hop, HttpUpstream, InterceptRequest, RequestMode, Upstream};

/// Which requests the layer handles and which it leaves alone.
#[derive(Debug, Clone)]
pub struct InterceptScope {
  /// Requests under this path prefix go straight to the network...
  pub api_prefix: String,
  /// ...unless they are under this one
  pub words_path: String,
  /// Cached page served to offline navigations
  pub offline_page: String,
}

impl InterceptScope {
  pub fn from_config(config: &Config) -> Self {
    Self {
      api_prefix: config.api.prefix.clone(),
      words_path: config.api.words_path.clone(),
      offline_page: config.cache.offline_page.clone(),
    }
  }
}

/// `path` is `base` itself or a segment below it.
fn is_under(path: &str, base: &str) -> bool {
  match path.strip_prefix(base) {
    Some(rest) => rest.is_empty() || base.ends_with('/') || rest.starts_with('/'),
    None => false,
  }
}

/// Routing decision for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Forward untouched
  Passthrough,
  /// Run stale-while-revalidate
  Cacheable,
}

/// A response plus where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: HttpResponse,
  pub source: ResponseSource,
}

impl Served {
  fn new(response: HttpResponse, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// Stale-while-revalidate interceptor.
pub struct Interceptor<S: ResponseStore + 'static, U: Upstream> {
  store: Arc<S>,
  upstream: Arc<U>,
  scope: InterceptScope,
  /// Tag of the generation new entries are written to
  generation: watch::Receiver<String>,
}

impl<S: ResponseStore + 'static, U: Upstream> Interceptor<S, U> {
  pub fn new(
    store: Arc<S>,
    upstream: Arc<U>,
    scope: InterceptScope,
    generation: watch::Receiver<String>,
  ) -> Self {
    Self {
      store,
      upstream,
      scope,
      generation,
    }
  }

  /// Decide whether a request is eligible for caching.
  pub fn route(&self, request: &InterceptRequest) -> Route {
    if !request.is_get() {
      return Route::Passthrough;
    }

    let path = request.url.path();
    if path.starts_with(&self.scope.api_prefix) && !is_under(path, &self.scope.words_path) {
      return Route::Passthrough;
    }

    Route::Cacheable
  }

  /// Handle one request.
  ///
  /// Cacheable requests always produce a response. Pass-through requests
  /// return the network result unchanged, including transport errors.
  pub async fn handle(&self, request: InterceptRequest) -> Result<Served> {
    match self.route(&request) {
      Route::Passthrough => {
        let response = self.upstream.fetch(&request).await?;
        Ok(Served::new(response, ResponseSource::Passthrough))
      }
      Route::Cacheable => Ok(self.stale_while_revalidate(request).await),
    }
  }

  async fn stale_while_revalidate(&self, request: InterceptRequest) -> Served {
    let key = request.key();

    let cached = self.store.match_request(&key).unwrap_or_else(|e| {
      warn!(request = %key, error = %e, "cache lookup failed, treating as miss");
      None
    });

    if let Some(entry) = cached {
      debug!(request = %key, cache = %entry.cache_name, "cache hit");
      self.spawn_revalidation(request);
      return Served::new(entry.response, ResponseSource::Cache);
    }

    match self.upstream.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_current(&key, &response);
        }
        Served::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(request = %key, error = %e, "network unavailable on cache miss");
        self.offline_response(&request)
      }
    }
  }

  /// Refresh a cache hit in the background. The task is detached and its
  /// failures are logged and dropped; the cached copy stays as it was.
  fn spawn_revalidation(&self, request: InterceptRequest) {
    let store = Arc::clone(&self.store);
    let upstream = Arc::clone(&self.upstream);
    let generation = self.generation.clone();

    tokio::spawn(async move {
      let key = request.key();
      match upstream.fetch(&request).await {
        Ok(response) if response.is_success() => {
          let name = generation.borrow().clone();
          if let Err(e) = store.put(&name, &key, &response) {
            debug!(request = %key, error = %e, "failed to store revalidated response");
          } else {
            debug!(request = %key, cache = %name, "revalidated");
          }
        }
        Ok(response) => {
          debug!(request = %key, status = response.status, "revalidation returned error status");
        }
        Err(e) => {
          debug!(request = %key, error = %e, "revalidation failed");
        }
      }
    });
  }

  /// Store a response in the current generation. Failures only cost the cache entry.
  fn store_current(&self, key: &RequestKey, response: &HttpResponse) {
    let name = self.generation.borrow().clone();
    if let Err(e) = self.store.put(&name, key, response) {
      warn!(request = %key, error = %e, "failed to cache response");
    }
  }

  fn offline_response(&self, request: &InterceptRequest) -> Served {
    if request.is_navigation() {
      match self.offline_page(request) {
        Some(page) => return Served::new(page, ResponseSource::OfflineFallback),
        None => warn!(url = %request.url, "offline page is not cached"),
      }
    }

    Served::new(
      HttpResponse::service_unavailable(),
      ResponseSource::Unavailable,
    )
  }

  fn offline_page(&self, request: &InterceptRequest) -> Option<HttpResponse> {
    let url = request.url.join(&self.scope.offline_page).ok()?;
    match self.store.match_request(&RequestKey::get(&url)) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(error = %e, "failed to read offline page from cache");
        None
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::SqliteResponseStore;
  use bytes::Bytes;
  use color_eyre::eyre::eyre;
  use std::collections::HashMap;
  use std::future::Future;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;
  use url::Url;

  /// Scripted upstream: serves canned responses by path and can be taken offline.
  #[derive(Default)]
  pub struct MockUpstream {
    responses: Mutex<HashMap<String, HttpResponse>>,
    offline: AtomicBool,
    calls: AtomicUsize,
  }

  impl MockUpstream {
    pub fn serve(&self, path: &str, response: HttpResponse) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(path.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Upstream for MockUpstream {
    fn fetch(
      &self,
      request: &InterceptRequest,
    ) -> impl Future<Output = Result<HttpResponse>> + Send {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = if self.offline.load(Ordering::SeqCst) {
        Err(eyre!("network unreachable"))
      } else {
        let path = match request.url.query() {
          Some(q) => format!("{}?{}", request.url.path(), q),
          None => request.url.path().to_string(),
        };
        Ok(
          self
            .responses
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, Vec::new(), "not found")),
        )
      };
      async move { result }
    }
  }

  pub fn page(body: &'static str) -> HttpResponse {
    HttpResponse::new(
      200,
      vec![("content-type".to_string(), "text/html".to_string())],
      body,
    )
  }

  pub fn url(path: &str) -> Url {
    Url::parse("http://localhost:3000").unwrap().join(path).unwrap()
  }

  struct Fixture {
    store: Arc<SqliteResponseStore>,
    upstream: Arc<MockUpstream>,
    interceptor: Interceptor<SqliteResponseStore, MockUpstream>,
    generation_tx: watch::Sender<String>,
  }

  fn fixture() -> Fixture {
    let store = Arc::new(SqliteResponseStore::open_in_memory().unwrap());
    let upstream = Arc::new(MockUpstream::default());
    let (tx, rx) = watch::channel("spellmaster-v1".to_string());
    let interceptor = Interceptor::new(
      Arc::clone(&store),
      Arc::clone(&upstream),
      InterceptScope::from_config(&Config::default()),
      rx,
    );
    Fixture {
      store,
      upstream,
      interceptor,
      generation_tx: tx,
    }
  }

  /// Poll until the background revalidation has landed.
  async fn wait_for_body(store: &SqliteResponseStore, key: &RequestKey, body: &[u8]) -> bool {
    for _ in 0..100 {
      if let Ok(Some(entry)) = store.match_request(key) {
        if entry.response.body.as_ref() == body {
          return true;
        }
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[test]
  fn test_route_filters() {
    let f = fixture();
    let route = |method: &str, path: &str| {
      f.interceptor
        .route(&InterceptRequest::new(method, url(path), Vec::new(), Bytes::new()))
    };

    assert_eq!(route("GET", "/practice"), Route::Cacheable);
    assert_eq!(route("GET", "/api/words?limit=10"), Route::Cacheable);
    assert_eq!(route("GET", "/api/words/random"), Route::Cacheable);
    assert_eq!(route("GET", "/api/words"), Route::Cacheable);
    assert_eq!(route("GET", "/api/wordsearch?q=cat"), Route::Passthrough);
    assert_eq!(route("GET", "/api/words-export"), Route::Passthrough);
    assert_eq!(route("GET", "/api/auth/me"), Route::Passthrough);
    assert_eq!(route("GET", "/api/word-lists"), Route::Passthrough);
    assert_eq!(route("POST", "/practice"), Route::Passthrough);
    assert_eq!(route("POST", "/api/words/import"), Route::Passthrough);
  }

  #[tokio::test]
  async fn test_miss_fetches_and_caches() {
    let f = fixture();
    f.upstream.serve("/practice", page("practice"));

    let served = f
      .interceptor
      .handle(InterceptRequest::get(url("/practice")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.body.as_ref(), b"practice");
    let entry = f
      .store
      .match_in("spellmaster-v1", &RequestKey::get(&url("/practice")))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, served.response);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let f = fixture();

    let served = f
      .interceptor
      .handle(InterceptRequest::get(url("/missing")))
      .await
      .unwrap();

    assert_eq!(served.response.status, 404);
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(f.store.entry_count("spellmaster-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_hit_offline_returns_cached_bytes() {
    let f = fixture();
    let stored = HttpResponse::new(
      200,
      vec![("content-type".to_string(), "text/html".to_string())],
      Bytes::from_static(b"<h1>practice</h1>\x00\xfe"),
    );
    f.store
      .put("spellmaster-v1", &RequestKey::get(&url("/practice")), &stored)
      .unwrap();
    f.upstream.set_offline(true);

    let served = f
      .interceptor
      .handle(InterceptRequest::navigate(url("/practice")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response, stored);

    // Failed revalidation leaves the entry untouched.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let entry = f
      .store
      .match_request(&RequestKey::get(&url("/practice")))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, stored);
  }

  #[tokio::test]
  async fn test_hit_revalidates_in_background() {
    let f = fixture();
    let key = RequestKey::get(&url("/api/words?difficulty=easy"));
    f.store.put("spellmaster-v1", &key, &page("stale")).unwrap();
    f.upstream.serve("/api/words?difficulty=easy", page("fresh"));

    let served = f
      .interceptor
      .handle(InterceptRequest::get(url("/api/words?difficulty=easy")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"stale");
    assert!(wait_for_body(&f.store, &key, b"fresh").await);
  }

  #[tokio::test]
  async fn test_revalidation_error_status_keeps_entry() {
    let f = fixture();
    let key = RequestKey::get(&url("/practice"));
    f.store.put("spellmaster-v1", &key, &page("kept")).unwrap();
    f.upstream
      .serve("/practice", HttpResponse::new(500, Vec::new(), "boom"));

    f.interceptor
      .handle(InterceptRequest::get(url("/practice")))
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.upstream.calls(), 1);
    let entry = f.store.match_request(&key).unwrap().unwrap();
    assert_eq!(entry.response.body.as_ref(), b"kept");
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_page() {
    let f = fixture();
    f.store
      .put(
        "spellmaster-v1",
        &RequestKey::get(&url("/offline")),
        &page("you are offline"),
      )
      .unwrap();
    f.upstream.set_offline(true);

    let served = f
      .interceptor
      .handle(InterceptRequest::navigate(url("/settings")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.body.as_ref(), b"you are offline");
  }

  #[tokio::test]
  async fn test_offline_data_request_gets_503() {
    let f = fixture();
    f.store
      .put(
        "spellmaster-v1",
        &RequestKey::get(&url("/offline")),
        &page("you are offline"),
      )
      .unwrap();
    f.upstream.set_offline(true);

    let served = f
      .interceptor
      .handle(InterceptRequest::get(url("/api/words?limit=5")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Unavailable);
    assert_eq!(served.response.status, 503);
    assert!(served.response.body.is_empty());
  }

  #[tokio::test]
  async fn test_offline_navigation_without_fallback_gets_503() {
    let f = fixture();
    f.upstream.set_offline(true);

    let served = f
      .interceptor
      .handle(InterceptRequest::navigate(url("/practice")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Unavailable);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_passthrough_surfaces_network_errors() {
    let f = fixture();
    f.upstream.set_offline(true);

    let result = f
      .interceptor
      .handle(InterceptRequest::get(url("/api/auth/me")))
      .await;
    assert!(result.is_err());

    f.upstream.set_offline(false);
    f.upstream.serve("/api/auth/me", page("{\"user\":null}"));
    let served = f
      .interceptor
      .handle(InterceptRequest::get(url("/api/auth/me")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Passthrough);
    assert_eq!(f.store.list_names().unwrap(), Vec::<String>::new());
  }

  #[tokio::test]
  async fn test_writes_follow_current_generation() {
    let f = fixture();
    f.upstream.serve("/", page("home"));
    f.generation_tx.send_replace("spellmaster-v2".to_string());

    f.interceptor
      .handle(InterceptRequest::get(url("/")))
      .await
      .unwrap();

    assert_eq!(f.store.entry_count("spellmaster-v2").unwrap(), 1);
    assert_eq!(f.store.entry_count("spellmaster-v1").unwrap(), 0);
  }
}
