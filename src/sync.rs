//! Moves practice words between the web API and the local store.

use color_eyre::{eyre::eyre, Result};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::api::types::{Word, WordFilter};
use crate::api::WordSource;
use crate::db::LocalStore;

/// Setting holding the id of the last user seen signed in.
pub const LAST_USER_SETTING: &str = "lastUserId";

/// Page size of the manual "download more" action.
const DOWNLOAD_LIMIT: u32 = 1000;

/// Outcome of merging a remote batch into the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
  /// Words newly persisted
  pub added: usize,
  /// New words the store failed to write
  pub skipped: usize,
  /// Words stored locally after the merge
  pub total: usize,
}

/// Where a refreshed working set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSource {
  Network,
  /// Network failed; served from the local store
  Offline,
}

#[derive(Debug, Clone)]
pub struct Refresh {
  pub words: Vec<Word>,
  pub source: RefreshSource,
}

/// Outcome of the session check that precedes a refresh.
enum Session {
  /// The API answered; the signed-in user's id, if any
  Checked(Option<i64>),
  Unreachable,
}

/// The words API does not say who owns a custom word; it is the user the
/// session belongs to. Custom words with no known owner stay hidden offline.
fn stamp_owner(mut words: Vec<Word>, owner: Option<i64>) -> Vec<Word> {
  for word in words.iter_mut().filter(|w| w.is_custom && w.user_id.is_none()) {
    word.user_id = owner;
  }
  words
}

/// Keeps the practice working set and the local store in step with the API.
pub struct SyncCoordinator<W: WordSource> {
  source: Arc<W>,
  store: Arc<LocalStore>,
  working_set: RwLock<Vec<Word>>,
}

impl<W: WordSource> SyncCoordinator<W> {
  pub fn new(source: Arc<W>, store: Arc<LocalStore>) -> Self {
    Self {
      source,
      store,
      working_set: RwLock::new(Vec::new()),
    }
  }

  /// Current in-memory practice words.
  pub fn working_set(&self) -> Vec<Word> {
    self
      .working_set
      .read()
      .map(|w| w.clone())
      .unwrap_or_default()
  }

  fn replace_working_set(&self, words: Vec<Word>) {
    match self.working_set.write() {
      Ok(mut set) => *set = words,
      Err(e) => warn!(error = %e, "working set lock poisoned"),
    }
  }

  /// Persist the words from `remote` that are not stored yet. Idempotent.
  pub fn download_and_merge(&self, remote: &[Word]) -> Result<MergeReport> {
    let existing: HashSet<i64> = self.store.get_all_words()?.iter().map(|w| w.id).collect();

    let mut seen = HashSet::new();
    let new_words: Vec<Word> = remote
      .iter()
      .filter(|w| !existing.contains(&w.id) && seen.insert(w.id))
      .cloned()
      .collect();

    if new_words.is_empty() {
      debug!(stored = existing.len(), "nothing new to merge");
      return Ok(MergeReport {
        added: 0,
        skipped: 0,
        total: existing.len(),
      });
    }

    let report = self.store.put_words(&new_words)?;
    info!(
      added = report.stored,
      skipped = report.skipped,
      "merged words into offline store"
    );

    Ok(MergeReport {
      added: report.stored,
      skipped: report.skipped,
      total: existing.len() + report.stored,
    })
  }

  /// Fetch a large ordered page of words and merge it into the local store.
  pub async fn download_more(&self) -> Result<MergeReport> {
    let filter = WordFilter {
      difficulty: None,
      random: false,
      limit: DOWNLOAD_LIMIT,
      offset: 0,
      list_id: None,
    };
    let owner = match self.check_session(&filter).await? {
      Session::Checked(owner) => owner,
      Session::Unreachable => None,
    };
    let page = self.source.fetch_words(&filter).await?;
    self.download_and_merge(&stamp_owner(page.words, owner))
  }

  /// Load practice words, preferring the network.
  ///
  /// On success the working set is replaced and persisted in the background
  /// (a failed write is only logged). When the network is unreachable the
  /// local store is read and filtered the same way instead. Custom lists need
  /// a signed-in user; that check is not bypassed by going offline.
  pub async fn refresh_from_network(&self, filter: &WordFilter) -> Result<Refresh> {
    let remote = match self.check_session(filter).await? {
      Session::Checked(owner) => self
        .source
        .fetch_words(filter)
        .await
        .map(|page| stamp_owner(page.words, owner)),
      Session::Unreachable if filter.list_id.is_none() => self
        .source
        .fetch_words(filter)
        .await
        .map(|page| page.words),
      Session::Unreachable => Err(eyre!("Session check failed")),
    };

    match remote {
      Ok(words) => {
        if !words.is_empty() {
          self.replace_working_set(words.clone());
          self.persist_in_background(words.clone());
        }
        Ok(Refresh {
          words,
          source: RefreshSource::Network,
        })
      }
      Err(e) => {
        warn!(error = %e, "falling back to offline words");
        let words = self.offline_words(filter)?;
        self.replace_working_set(words.clone());
        Ok(Refresh {
          words,
          source: RefreshSource::Offline,
        })
      }
    }
  }

  /// Ask who the session belongs to and remember the answer as the last
  /// known user. `Err` when the filter needs a user and nobody is signed in.
  async fn check_session(&self, filter: &WordFilter) -> Result<Session> {
    let user = match self.source.current_user().await {
      Ok(user) => user,
      Err(e) => {
        debug!(error = %e, "could not check session");
        return Ok(Session::Unreachable);
      }
    };

    let owner = user.map(|u| u.id);
    if let Err(e) = self.store.put_setting(LAST_USER_SETTING, &owner) {
      debug!(error = %e, "failed to remember signed-in user");
    }

    if owner.is_none() && filter.list_id.is_some() {
      return Err(eyre!("Word lists require a signed-in user"));
    }
    Ok(Session::Checked(owner))
  }

  fn persist_in_background(&self, words: Vec<Word>) {
    let store = Arc::clone(&self.store);
    tokio::task::spawn_blocking(move || match store.put_words(&words) {
      Ok(report) => debug!(stored = report.stored, skipped = report.skipped, "saved words offline"),
      Err(e) => warn!(error = %e, "failed to save words offline"),
    });
  }

  /// Stored words filtered client-side. Errors mean offline data is unavailable.
  fn offline_words(&self, filter: &WordFilter) -> Result<Vec<Word>> {
    let last_user: Option<i64> = self
      .store
      .get_setting::<Option<i64>>(LAST_USER_SETTING)
      .unwrap_or(None)
      .flatten();
    if filter.list_id.is_some() {
      debug!("list membership is not stored offline; filtering by difficulty only");
    }

    let mut words: Vec<Word> = self
      .store
      .get_all_words()
      .map_err(|e| e.wrap_err("Offline words unavailable"))?
      .into_iter()
      .filter(|w| filter.matches(w))
      .filter(|w| !w.is_custom || (w.user_id.is_some() && w.user_id == last_user))
      .collect();

    if filter.random {
      words.shuffle(&mut rand::rng());
    } else {
      words.sort_by(|a, b| a.word.cmp(&b.word));
    }

    Ok(
      words
        .into_iter()
        .skip(filter.offset as usize)
        .take(filter.limit as usize)
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Difficulty, User, WordsPage};
  use std::future::Future;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  #[derive(Default)]
  struct MockSource {
    words: Mutex<Vec<Word>>,
    user: Mutex<Option<User>>,
    offline: AtomicBool,
    word_requests: AtomicUsize,
    last_filter: Mutex<Option<WordFilter>>,
  }

  impl WordSource for MockSource {
    fn fetch_words(&self, filter: &WordFilter) -> impl Future<Output = Result<WordsPage>> + Send {
      self.word_requests.fetch_add(1, Ordering::SeqCst);
      *self.last_filter.lock().unwrap() = Some(filter.clone());
      let result = if self.offline.load(Ordering::SeqCst) {
        Err(eyre!("network unreachable"))
      } else {
        let words = self.words.lock().unwrap().clone();
        let total = words.len() as u64;
        Ok(WordsPage { words, total })
      };
      async move { result }
    }

    fn current_user(&self) -> impl Future<Output = Result<Option<User>>> + Send {
      let result = if self.offline.load(Ordering::SeqCst) {
        Err(eyre!("network unreachable"))
      } else {
        Ok(self.user.lock().unwrap().clone())
      };
      async move { result }
    }
  }

  fn word(id: i64, text: &str, difficulty: Difficulty) -> Word {
    Word {
      id,
      word: text.to_string(),
      definition: format!("definition of {}", text),
      example: String::new(),
      difficulty,
      category: None,
      is_custom: false,
      user_id: None,
      created_at: None,
    }
  }

  fn coordinator(words: Vec<Word>) -> (Arc<MockSource>, Arc<LocalStore>, SyncCoordinator<MockSource>) {
    let source = Arc::new(MockSource::default());
    *source.words.lock().unwrap() = words;
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let sync = SyncCoordinator::new(Arc::clone(&source), Arc::clone(&store));
    (source, store, sync)
  }

  fn ids(words: &[Word]) -> Vec<i64> {
    let mut ids: Vec<i64> = words.iter().map(|w| w.id).collect();
    ids.sort();
    ids
  }

  async fn wait_for_count(store: &LocalStore, count: usize) -> bool {
    for _ in 0..100 {
      if store.word_count().unwrap() == count {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[test]
  fn test_merge_only_adds_missing_words() {
    let (_, store, sync) = coordinator(vec![]);
    store
      .put_words(&[word(1, "cat", Difficulty::Easy)])
      .unwrap();

    let remote = vec![
      Word {
        definition: "changed upstream".to_string(),
        ..word(1, "cat", Difficulty::Easy)
      },
      word(2, "dog", Difficulty::Hard),
      word(2, "dog", Difficulty::Hard),
    ];
    let report = sync.download_and_merge(&remote).unwrap();

    assert_eq!(report, MergeReport { added: 1, skipped: 0, total: 2 });
    let stored = store.get_all_words().unwrap();
    assert_eq!(ids(&stored), vec![1, 2]);
    // Existing records are not rewritten by a merge.
    let cat = stored.iter().find(|w| w.id == 1).unwrap();
    assert_eq!(cat.definition, "definition of cat");
  }

  #[test]
  fn test_merge_is_idempotent() {
    let (_, store, sync) = coordinator(vec![]);
    let remote = vec![
      word(1, "cat", Difficulty::Easy),
      word(2, "dog", Difficulty::Hard),
    ];

    sync.download_and_merge(&remote).unwrap();
    let once = store.get_all_words().unwrap();
    let second = sync.download_and_merge(&remote).unwrap();
    let twice = store.get_all_words().unwrap();

    assert_eq!(second.added, 0);
    assert_eq!(second.total, 2);
    assert_eq!(ids(&once), ids(&twice));
  }

  #[test]
  fn test_merge_counts_records_the_store_rejects() {
    let (_, store, sync) = coordinator(vec![]);
    store
      .execute_batch(
        "CREATE TRIGGER reject_two BEFORE INSERT ON words WHEN NEW.id = 2
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
      )
      .unwrap();

    let report = sync
      .download_and_merge(&[
        word(1, "cat", Difficulty::Easy),
        word(2, "dog", Difficulty::Hard),
        word(3, "ant", Difficulty::Medium),
      ])
      .unwrap();

    assert_eq!(report, MergeReport { added: 2, skipped: 1, total: 2 });
    assert_eq!(ids(&store.get_all_words().unwrap()), vec![1, 3]);
  }

  #[tokio::test]
  async fn test_download_more_requests_ordered_page() {
    let (source, store, sync) = coordinator(vec![
      word(1, "cat", Difficulty::Easy),
      word(2, "dog", Difficulty::Hard),
    ]);

    let report = sync.download_more().await.unwrap();

    assert_eq!(report.added, 2);
    assert_eq!(store.word_count().unwrap(), 2);
    let filter = source.last_filter.lock().unwrap().clone().unwrap();
    assert_eq!(filter.limit, 1000);
    assert!(!filter.random);
  }

  #[tokio::test]
  async fn test_refresh_online_replaces_set_and_persists() {
    let (_, store, sync) = coordinator(vec![
      word(1, "cat", Difficulty::Easy),
      word(2, "dog", Difficulty::Hard),
    ]);

    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();

    assert_eq!(refresh.source, RefreshSource::Network);
    assert_eq!(ids(&refresh.words), vec![1, 2]);
    assert_eq!(ids(&sync.working_set()), vec![1, 2]);
    assert!(wait_for_count(&store, 2).await);
  }

  #[tokio::test]
  async fn test_refresh_offline_filters_local_words() {
    let (source, store, sync) = coordinator(vec![]);
    store
      .put_words(&[
        word(1, "cat", Difficulty::Easy),
        word(2, "dog", Difficulty::Hard),
        word(3, "ant", Difficulty::Easy),
      ])
      .unwrap();
    source.offline.store(true, Ordering::SeqCst);

    let filter = WordFilter {
      difficulty: Some(Difficulty::Easy),
      random: false,
      ..WordFilter::default()
    };
    let refresh = sync.refresh_from_network(&filter).await.unwrap();

    assert_eq!(refresh.source, RefreshSource::Offline);
    let words: Vec<&str> = refresh.words.iter().map(|w| w.word.as_str()).collect();
    assert_eq!(words, vec!["ant", "cat"]);
    assert_eq!(sync.working_set().len(), 2);
  }

  #[tokio::test]
  async fn test_refresh_offline_applies_limit() {
    let (source, store, sync) = coordinator(vec![]);
    store
      .put_words(&(1..=10).map(|i| word(i, &format!("w{:02}", i), Difficulty::Medium)).collect::<Vec<_>>())
      .unwrap();
    source.offline.store(true, Ordering::SeqCst);

    let filter = WordFilter {
      limit: 3,
      ..WordFilter::default()
    };
    let refresh = sync.refresh_from_network(&filter).await.unwrap();
    assert_eq!(refresh.words.len(), 3);
  }

  #[tokio::test]
  async fn test_offline_hides_other_users_custom_words() {
    let (source, store, sync) = coordinator(vec![]);
    store
      .put_words(&[
        word(1, "cat", Difficulty::Easy),
        Word {
          is_custom: true,
          user_id: Some(7),
          ..word(2, "mine", Difficulty::Easy)
        },
        Word {
          is_custom: true,
          user_id: Some(8),
          ..word(3, "theirs", Difficulty::Easy)
        },
      ])
      .unwrap();
    store.put_setting(LAST_USER_SETTING, &7).unwrap();
    source.offline.store(true, Ordering::SeqCst);

    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert_eq!(ids(&refresh.words), vec![1, 2]);
  }

  fn sign_in(source: &MockSource, id: i64) {
    *source.user.lock().unwrap() = Some(User {
      id,
      name: format!("user{}", id),
      email: format!("user{}@example.com", id),
    });
  }

  #[tokio::test]
  async fn test_custom_words_from_api_belong_to_session_user() {
    // The words API sends no owner for custom words.
    let remote: Vec<Word> = serde_json::from_str(
      r#"[
        {"id":1,"word":"cat","definition":"a small feline","example":"","difficulty":"easy","category":null,"is_custom":0},
        {"id":5,"word":"secret","definition":"kept hidden","example":"","difficulty":"easy","category":null,"is_custom":1}
      ]"#,
    )
    .unwrap();
    assert_eq!(remote[1].user_id, None);
    let (source, store, sync) = coordinator(remote);
    sign_in(&source, 99);

    sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert!(wait_for_count(&store, 2).await);
    let secret = store
      .get_all_words()
      .unwrap()
      .into_iter()
      .find(|w| w.id == 5)
      .unwrap();
    assert_eq!(secret.user_id, Some(99));
    assert_eq!(
      store.get_setting::<Option<i64>>(LAST_USER_SETTING).unwrap(),
      Some(Some(99))
    );

    source.offline.store(true, Ordering::SeqCst);
    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert_eq!(ids(&refresh.words), vec![1, 5]);

    store.put_setting(LAST_USER_SETTING, &5).unwrap();
    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert_eq!(ids(&refresh.words), vec![1]);
  }

  #[tokio::test]
  async fn test_unowned_custom_words_hidden_offline() {
    let (source, store, sync) = coordinator(vec![]);
    store
      .put_words(&[
        word(1, "cat", Difficulty::Easy),
        Word {
          is_custom: true,
          ..word(2, "orphan", Difficulty::Easy)
        },
      ])
      .unwrap();
    store.put_setting(LAST_USER_SETTING, &7).unwrap();
    source.offline.store(true, Ordering::SeqCst);

    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert_eq!(ids(&refresh.words), vec![1]);
  }

  #[tokio::test]
  async fn test_sign_out_hides_custom_words_offline() {
    let (source, store, sync) = coordinator(vec![word(1, "cat", Difficulty::Easy)]);
    store
      .put_words(&[Word {
        is_custom: true,
        user_id: Some(7),
        ..word(2, "mine", Difficulty::Easy)
      }])
      .unwrap();
    store.put_setting(LAST_USER_SETTING, &7).unwrap();

    // Anonymous session answers; the last known user is cleared.
    sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert_eq!(
      store.get_setting::<Option<i64>>(LAST_USER_SETTING).unwrap(),
      Some(None)
    );

    source.offline.store(true, Ordering::SeqCst);
    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();
    assert!(!refresh.words.iter().any(|w| w.id == 2));
  }

  #[tokio::test]
  async fn test_list_filter_requires_signed_in_user() {
    let (source, _, sync) = coordinator(vec![word(1, "cat", Difficulty::Easy)]);
    let filter = WordFilter {
      list_id: Some(3),
      ..WordFilter::default()
    };

    assert!(sync.refresh_from_network(&filter).await.is_err());
    assert_eq!(source.word_requests.load(Ordering::SeqCst), 0);

    *source.user.lock().unwrap() = Some(User {
      id: 5,
      name: "Ana".to_string(),
      email: "ana@example.com".to_string(),
    });
    let refresh = sync.refresh_from_network(&filter).await.unwrap();
    assert_eq!(refresh.source, RefreshSource::Network);
    assert_eq!(
      source.last_filter.lock().unwrap().as_ref().unwrap().list_id,
      Some(3)
    );
  }

  #[tokio::test]
  async fn test_empty_network_result_keeps_working_set() {
    let (source, _, sync) = coordinator(vec![word(1, "cat", Difficulty::Easy)]);
    sync.refresh_from_network(&WordFilter::default()).await.unwrap();

    source.words.lock().unwrap().clear();
    let refresh = sync.refresh_from_network(&WordFilter::default()).await.unwrap();

    assert!(refresh.words.is_empty());
    assert_eq!(ids(&sync.working_set()), vec![1]);
  }
}
