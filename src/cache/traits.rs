//! Core types for the response cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Identity of a cacheable request: method plus full URL (query string included).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.as_str().to_string(),
    }
  }

  /// Key for a GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A complete HTTP response held in memory.
///
/// The body is an immutable shared buffer, so handing one copy to the cache
/// and another to the caller is a reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  /// Headers in the order they were received
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl HttpResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// Synthetic response for a request that could not be served at all.
  pub fn service_unavailable() -> Self {
    Self::new(503, Vec::new(), Bytes::new())
  }

  /// 2xx status
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response found in one of the named caches.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: HttpResponse,
  /// Name of the cache (generation) holding the entry
  pub cache_name: String,
  pub stored_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the network, now cached
  Network,
  /// Served from cache; a background revalidation was started
  Cache,
  /// Network unavailable, navigation answered with the offline page
  OfflineFallback,
  /// Network unavailable and nothing cached: synthetic 503
  Unavailable,
  /// Not eligible for caching, forwarded as-is
  Passthrough,
}
