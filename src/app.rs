use crate::api::types::{ImportRequest, ParsedWord, WordFilter};
use crate::api::ApiClient;
use crate::cache::{ResponseStore, SqliteResponseStore};
use crate::config::Config;
use crate::db::{LocalStore, SharedStore};
use crate::lifecycle::SKIP_WAITING;
use crate::server;
use crate::sync::{RefreshSource, SyncCoordinator};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Setting keys written by the settings screen
pub const DEFAULT_SPEED_SETTING: &str = "defaultSpeed";
pub const AUTO_SPEAK_SETTING: &str = "autoSpeak";

const DEFAULT_SPEED: f64 = 0.8;

/// Command-line front end over the offline store, sync coordinator and front server
pub struct App {
  config: Config,
  data_dir: PathBuf,
  store: SharedStore,
  api: Arc<ApiClient>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = SharedStore::new(SharedStore::default_path(&data_dir));
    let api = Arc::new(ApiClient::new(&config)?);

    Ok(Self {
      config,
      data_dir,
      store,
      api,
    })
  }

  async fn local_store(&self) -> Result<Arc<LocalStore>> {
    self
      .store
      .open()
      .await
      .map_err(|e| e.wrap_err("Offline data unavailable"))
  }

  async fn sync(&self) -> Result<SyncCoordinator<ApiClient>> {
    Ok(SyncCoordinator::new(
      Arc::clone(&self.api),
      self.local_store().await?,
    ))
  }

  pub async fn serve(&self) -> Result<()> {
    server::run(&self.config, &self.data_dir).await
  }

  pub async fn practice(&self, filter: &WordFilter) -> Result<()> {
    let sync = self.sync().await?;
    let refresh = sync.refresh_from_network(filter).await?;

    let store = self.local_store().await?;
    let speed: f64 = store
      .get_setting(DEFAULT_SPEED_SETTING)?
      .unwrap_or(DEFAULT_SPEED);
    let auto_speak: bool = store.get_setting(AUTO_SPEAK_SETTING)?.unwrap_or(true);

    if refresh.source == RefreshSource::Offline {
      println!(
        "Offline mode: {} words available locally",
        refresh.words.len()
      );
    }
    println!("speech rate {:.1}x, auto-speak {}", speed, if auto_speak { "on" } else { "off" });

    if refresh.words.is_empty() {
      println!("No words available. Try another difficulty or sync when online.");
      return Ok(());
    }

    for word in &refresh.words {
      println!("{} [{}]: {}", word.word, word.difficulty, word.definition);
      if !word.example.is_empty() {
        println!("    {}", word.example);
      }
    }
    Ok(())
  }

  pub async fn download(&self) -> Result<()> {
    let sync = self.sync().await?;
    let report = sync.download_more().await?;
    println!(
      "{} new words saved ({} skipped), {} available offline",
      report.added, report.skipped, report.total
    );
    Ok(())
  }

  pub async fn clear(&self) -> Result<()> {
    self.local_store().await?.clear_words()?;
    info!("cleared offline words");
    println!("Offline words deleted");
    Ok(())
  }

  pub async fn get_setting(&self, key: &str) -> Result<()> {
    let value: Option<serde_json::Value> = self.local_store().await?.get_setting(key)?;
    match value {
      Some(v) => println!("{}", v),
      None => println!("null"),
    }
    Ok(())
  }

  pub async fn set_setting(&self, key: &str, raw: &str) -> Result<()> {
    let value = parse_setting_value(raw);
    self.local_store().await?.put_setting(key, &value)?;
    println!("{} = {}", key, value);
    Ok(())
  }

  pub async fn lists(&self) -> Result<()> {
    let lists = self.api.get_word_lists().await?;
    if lists.is_empty() {
      println!("No word lists (are you signed in?)");
    }
    for list in lists {
      println!("{:>6}  {}", list.id, list.name);
    }
    Ok(())
  }

  pub async fn import(&self, file: &Path, list_name: Option<String>) -> Result<()> {
    let contents = std::fs::read_to_string(file)
      .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
    let words: Vec<ParsedWord> = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse {}: {}", file.display(), e))?;
    if words.is_empty() {
      return Err(eyre!("No words to import in {}", file.display()));
    }

    let result = self
      .api
      .import_words(&ImportRequest { words, list_name })
      .await?;
    println!(
      "Imported {} of {} words ({} skipped)",
      result.imported, result.total, result.skipped
    );
    if let Some(list_id) = result.list_id {
      println!("Created list {}", list_id);
    }
    Ok(())
  }

  pub async fn status(&self) -> Result<()> {
    match self.local_store().await {
      Ok(store) => {
        println!("offline words: {}", store.word_count()?);
        let speed: Option<f64> = store.get_setting(DEFAULT_SPEED_SETTING)?;
        let auto_speak: Option<bool> = store.get_setting(AUTO_SPEAK_SETTING)?;
        println!(
          "settings: defaultSpeed={} autoSpeak={}",
          speed.unwrap_or(DEFAULT_SPEED),
          auto_speak.unwrap_or(true)
        );
      }
      Err(e) => println!("offline store unavailable: {}", e),
    }

    let responses =
      SqliteResponseStore::open(&SqliteResponseStore::default_path(&self.data_dir))?;
    let active = responses.active_generation()?;
    for name in responses.list_names()? {
      let marker = if active.as_deref() == Some(name.as_str()) {
        "*"
      } else {
        " "
      };
      println!("{} {} ({} entries)", marker, name, responses.entry_count(&name)?);
    }
    if active.as_deref() != Some(self.config.cache.generation.as_str()) {
      println!(
        "configured generation {} is not active yet",
        self.config.cache.generation
      );
    }
    Ok(())
  }

  pub async fn promote(&self) -> Result<()> {
    let url = format!("http://{}/__spellmaster/message", self.config.listen);
    let reply: serde_json::Value = reqwest::Client::new()
      .post(&url)
      .body(SKIP_WAITING)
      .send()
      .await
      .map_err(|e| eyre!("Is `spellmaster serve` running on {}? {}", self.config.listen, e))?
      .error_for_status()?
      .json()
      .await?;

    if reply["applied"].as_bool().unwrap_or(false) {
      println!("Promoted waiting generation; open clients will reload");
    } else {
      println!("No generation is waiting");
    }
    Ok(())
  }
}

/// JSON when it parses, plain string otherwise.
fn parse_setting_value(raw: &str) -> serde_json::Value {
  serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
