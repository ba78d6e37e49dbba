//! Wire types for the SpellMaster web API.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Word difficulty level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
  Easy,
  Medium,
  Hard,
}

impl Difficulty {
  pub fn as_str(&self) -> &'static str {
    match self {
      Difficulty::Easy => "easy",
      Difficulty::Medium => "medium",
      Difficulty::Hard => "hard",
    }
  }
}

impl fmt::Display for Difficulty {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Difficulty {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "easy" => Ok(Difficulty::Easy),
      "medium" => Ok(Difficulty::Medium),
      "hard" => Ok(Difficulty::Hard),
      other => Err(format!("unknown difficulty '{}'", other)),
    }
  }
}

/// A practice word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
  pub id: i64,
  pub word: String,
  pub definition: String,
  #[serde(default)]
  pub example: String,
  pub difficulty: Difficulty,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, deserialize_with = "deserialize_flag")]
  pub is_custom: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<String>,
}

/// MySQL hands booleans back as 0/1, so accept either shape.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Flag {
    Bool(bool),
    Int(i64),
  }

  Ok(match Flag::deserialize(deserializer)? {
    Flag::Bool(b) => b,
    Flag::Int(n) => n != 0,
  })
}

/// Response of `GET /api/words`
#[derive(Debug, Clone, Deserialize)]
pub struct WordsPage {
  pub words: Vec<Word>,
  #[serde(default)]
  pub total: u64,
}

/// User-owned word list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordList {
  pub id: i64,
  pub name: String,
  pub user_id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub word_count: Option<u64>,
}

/// Response of `GET /api/word-lists`
#[derive(Debug, Clone, Deserialize)]
pub struct WordListsResponse {
  #[serde(default)]
  pub lists: Vec<WordList>,
}

/// A word parsed from an imported CSV/Excel file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedWord {
  pub word: String,
  pub definition: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub example: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub difficulty: Option<Difficulty>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

/// Body of `POST /api/words/import`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
  pub words: Vec<ParsedWord>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub list_name: Option<String>,
}

/// Response of `POST /api/words/import`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
  pub imported: u64,
  pub skipped: u64,
  pub total: u64,
  pub list_id: Option<i64>,
}

/// Signed-in user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: i64,
  pub name: String,
  pub email: String,
}

/// Response of `GET /api/auth/me`
#[derive(Debug, Clone, Deserialize)]
pub struct MeResponse {
  pub user: Option<User>,
}

/// Filter criteria for a practice word request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordFilter {
  /// `None` means every difficulty
  pub difficulty: Option<Difficulty>,
  pub random: bool,
  pub limit: u32,
  pub offset: u32,
  /// Restrict to a user's custom list
  pub list_id: Option<i64>,
}

impl Default for WordFilter {
  fn default() -> Self {
    Self {
      difficulty: None,
      random: true,
      limit: 100,
      offset: 0,
      list_id: None,
    }
  }
}

impl WordFilter {
  /// Query pairs for `GET /api/words`.
  pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
      (
        "difficulty",
        self
          .difficulty
          .map(|d| d.as_str().to_string())
          .unwrap_or_else(|| "all".to_string()),
      ),
      ("random", self.random.to_string()),
      ("limit", self.limit.to_string()),
      ("offset", self.offset.to_string()),
    ];
    if let Some(list_id) = self.list_id {
      pairs.push(("listId", list_id.to_string()));
    }
    pairs
  }

  /// Whether a stored word satisfies the difficulty criterion.
  pub fn matches(&self, word: &Word) -> bool {
    self.difficulty.map_or(true, |d| word.difficulty == d)
  }
}
