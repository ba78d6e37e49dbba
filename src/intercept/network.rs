//! Upstream network access for intercepted requests.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::cache::{HttpResponse, RequestKey};
use crate::config::Config;

/// Headers that describe a single hop and never get forwarded.
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
  HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// How the client issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Anything else (fetch/XHR, assets)
  Other,
}

impl RequestMode {
  /// Classify from request headers: `Sec-Fetch-Mode: navigate`, or a GET that prefers HTML.
  pub fn detect(method: &str, headers: &[(String, String)]) -> Self {
    let header = |name: &str| {
      headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
    };

    if let Some(mode) = header("sec-fetch-mode") {
      return if mode.eq_ignore_ascii_case("navigate") {
        RequestMode::Navigate
      } else {
        RequestMode::Other
      };
    }

    let wants_html = header("accept")
      .and_then(|accept| accept.split(',').next())
      .is_some_and(|first| first.trim().starts_with("text/html"));

    if method.eq_ignore_ascii_case("GET") && wants_html {
      RequestMode::Navigate
    } else {
      RequestMode::Other
    }
  }
}

/// A request flowing through the interception layer.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub mode: RequestMode,
}

impl InterceptRequest {
  pub fn new(method: &str, url: Url, headers: Vec<(String, String)>, body: Bytes) -> Self {
    let mode = RequestMode::detect(method, &headers);
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers,
      body,
      mode,
    }
  }

  /// Plain GET with no headers.
  pub fn get(url: Url) -> Self {
    Self::new("GET", url, Vec::new(), Bytes::new())
  }

  /// Page navigation to `url`.
  #[cfg(test)]
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// The network as seen by the interception layer.
///
/// `Ok` means a response arrived, whatever its status; `Err` means the
/// transport failed (offline, DNS, connection refused, timeout).
pub trait Upstream: Send + Sync + 'static {
  fn fetch(&self, request: &InterceptRequest) -> impl Future<Output = Result<HttpResponse>> + Send;
}

/// Upstream backed by a reqwest client.
#[derive(Clone)]
pub struct HttpUpstream {
  client: reqwest::Client,
}

impl HttpUpstream {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    if let Some(secs) = config.request_timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }

  async fn send(&self, request: &InterceptRequest) -> Result<HttpResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

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
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?;

    Ok(HttpResponse::new(status, headers, body))
  }
}

impl Upstream for HttpUpstream {
  fn fetch(&self, request: &InterceptRequest) -> impl Future<Output = Result<HttpResponse>> + Send {
    self.send(request)
  }
}
