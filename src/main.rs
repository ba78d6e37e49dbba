mod api;
mod app;
mod cache;
mod config;
mod db;
mod event;
mod intercept;
mod lifecycle;
mod logging;
mod server;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use api::types::Difficulty;

#[derive(Parser, Debug)]
#[command(name = "spellmaster")]
#[command(about = "Offline-first cache and sync for SpellMaster vocabulary practice")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spellmaster/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the SpellMaster web app
  #[arg(short, long)]
  origin: Option<String>,

  /// Log level when RUST_LOG is unset
  #[arg(long, default_value = "info")]
  log_level: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the offline front in front of the web app
  Serve {
    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,
  },
  /// Load practice words, falling back to the offline store
  Practice {
    /// easy, medium or hard (default: all)
    #[arg(short, long)]
    difficulty: Option<Difficulty>,
    /// Restrict to one of your word lists
    #[arg(long)]
    list: Option<i64>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
    /// Alphabetical instead of shuffled
    #[arg(long)]
    ordered: bool,
  },
  /// Download more words into the offline store
  Download,
  /// Delete every offline word
  Clear,
  /// Read or write a setting
  Settings {
    #[command(subcommand)]
    action: SettingsAction,
  },
  /// Show your word lists
  Lists,
  /// Import parsed words from a JSON file
  Import {
    file: PathBuf,
    /// Create a list with this name for the imported words
    #[arg(long)]
    list_name: Option<String>,
  },
  /// Show offline store and cache generation status
  Status,
  /// Promote a waiting cache generation on a running front
  Promote,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
  Get { key: String },
  /// VALUE is parsed as JSON, falling back to a plain string
  Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Command::Serve {
    listen: Some(listen),
  } = &args.command
  {
    config.listen = listen.clone();
  }

  let _log_guard = logging::init(&config.data_dir()?, &args.log_level)?;

  let app = app::App::new(config)?;
  match args.command {
    Command::Serve { .. } => app.serve().await,
    Command::Practice {
      difficulty,
      list,
      limit,
      ordered,
    } => {
      let filter = api::types::WordFilter {
        difficulty,
        random: !ordered,
        limit,
        offset: 0,
        list_id: list,
      };
      app.practice(&filter).await
    }
    Command::Download => app.download().await,
    Command::Clear => app.clear().await,
    Command::Settings { action } => match action {
      SettingsAction::Get { key } => app.get_setting(&key).await,
      SettingsAction::Set { key, value } => app.set_setting(&key, &value).await,
    },
    Command::Lists => app.lists().await,
    Command::Import { file, list_name } => app.import(&file, list_name).await,
    Command::Status => app.status().await,
    Command::Promote => app.promote().await,
  }
}
