//! Network boundary to the SpellMaster web application.

pub mod client;
pub mod types;

use color_eyre::Result;
use std::future::Future;

pub use client::ApiClient;
use types::{User, WordFilter, WordsPage};

/// Source of practice words consumed by the sync coordinator.
pub trait WordSource: Send + Sync + 'static {
  /// Fetch one page of words matching `filter`.
  fn fetch_words(&self, filter: &WordFilter) -> impl Future<Output = Result<WordsPage>> + Send;

  /// The user the session belongs to, `None` when anonymous.
  fn current_user(&self) -> impl Future<Output = Result<Option<User>>> + Send;
}

impl WordSource for ApiClient {
  fn fetch_words(&self, filter: &WordFilter) -> impl Future<Output = Result<WordsPage>> + Send {
    self.get_words(filter)
  }

  fn current_user(&self) -> impl Future<Output = Result<Option<User>>> + Send {
    self.me()
  }
}
