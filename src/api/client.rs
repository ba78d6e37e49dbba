use crate::api::types::{
  ImportRequest, ImportResult, MeResponse, User, WordFilter, WordList, WordListsResponse,
  WordsPage,
};
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// SpellMaster web API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin URL {}: {}", config.origin, e))?;

    let mut headers = HeaderMap::new();
    if let Some(session) = Config::get_session_id() {
      let cookie = HeaderValue::from_str(&format!("session_id={}", session))
        .map_err(|e| eyre!("Invalid session id: {}", e))?;
      headers.insert(COOKIE, cookie);
    }

    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(secs) = config.request_timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let http = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
    let response = self
      .http
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Get practice words matching a filter
  pub async fn get_words(&self, filter: &WordFilter) -> Result<WordsPage> {
    let mut url = self.endpoint("/api/words")?;
    url
      .query_pairs_mut()
      .extend_pairs(filter.query_pairs().iter().map(|(k, v)| (*k, v.as_str())));
    self.get_json(url).await
  }

  /// Get the signed-in user's word lists (empty when anonymous)
  pub async fn get_word_lists(&self) -> Result<Vec<WordList>> {
    let url = self.endpoint("/api/word-lists")?;
    let response: WordListsResponse = self.get_json(url).await?;
    Ok(response.lists)
  }

  /// Import parsed words, optionally into a new list
  pub async fn import_words(&self, request: &ImportRequest) -> Result<ImportResult> {
    let url = self.endpoint("/api/words/import")?;
    let response = self
      .http
      .post(url.clone())
      .json(request)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Import failed: {}", e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse import result: {}", e))
  }

  /// Get the current session's user, if any
  pub async fn me(&self) -> Result<Option<User>> {
    let url = self.endpoint("/api/auth/me")?;
    let response: MeResponse = self.get_json(url).await?;
    Ok(response.user)
  }
}
