use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the SpellMaster web application
  pub origin: String,
  /// Address the offline front listens on
  pub listen: String,
  /// Overrides $XDG_DATA_HOME/spellmaster
  pub data_dir: Option<PathBuf>,
  /// Transport timeout for upstream requests; unset means the client default
  pub request_timeout_secs: Option<u64>,
  pub cache: CacheConfig,
  pub api: ApiConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      listen: "127.0.0.1:8787".to_string(),
      data_dir: None,
      request_timeout_secs: None,
      cache: CacheConfig::default(),
      api: ApiConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Tag of the cache generation this build ships
  pub generation: String,
  /// Shell routes fetched into a generation when it installs
  pub precache: Vec<String>,
  /// Page served to navigations that miss the cache while offline
  pub offline_page: String,
  /// Promote a freshly installed generation without waiting for a control message
  pub skip_waiting: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "spellmaster-v1".to_string(),
      precache: ["/", "/practice", "/login", "/register", "/offline"]
        .into_iter()
        .map(String::from)
        .collect(),
      offline_page: "/offline".to_string(),
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Requests under this prefix bypass the cache
  pub prefix: String,
  /// Sub-path of the API that stays cacheable
  pub words_path: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      prefix: "/api/".to_string(),
      words_path: "/api/words".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spellmaster.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spellmaster/config.yaml
  ///
  /// Falls back to defaults when no file exists. `SPELLMASTER_ORIGIN` overrides the origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(origin) = std::env::var("SPELLMASTER_ORIGIN") {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("spellmaster.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("spellmaster").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Directory holding the offline database, response cache and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("spellmaster"))
  }

  /// Session cookie value for authenticated API calls.
  ///
  /// Read from SPELLMASTER_SESSION; anonymous access when unset.
  pub fn get_session_id() -> Option<String> {
    std::env::var("SPELLMASTER_SESSION")
      .ok()
      .filter(|s| !s.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let config = Config::parse("origin: https://spell.example.com\ncache:\n  generation: spellmaster-v2\n")
      .unwrap();
    assert_eq!(config.origin, "https://spell.example.com");
    assert_eq!(config.cache.generation, "spellmaster-v2");
    assert_eq!(config.cache.offline_page, "/offline");
    assert!(config.cache.skip_waiting);
    assert_eq!(config.api.words_path, "/api/words");
  }

  #[test]
  fn test_default_precache_manifest() {
    let config = Config::default();
    assert_eq!(
      config.cache.precache,
      vec!["/", "/practice", "/login", "/register", "/offline"]
    );
  }

  #[test]
  fn test_explicit_data_dir() {
    let config = Config::parse("data_dir: /tmp/spellmaster-test\n").unwrap();
    assert_eq!(
      config.data_dir().unwrap(),
      PathBuf::from("/tmp/spellmaster-test")
    );
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/spellmaster.yaml"))).is_err());
  }
}
