//! Generation lifecycle for the interception layer.
//!
//! A generation moves through `Installing -> Installed -> Activating -> Active`
//! and ends `Redundant`. Installing precaches the shell manifest into the
//! generation's cache; activating sweeps every other cache so exactly one
//! generation stays live. A generation that installs while another is active
//! waits, raising the one-shot "update available" flag until it is promoted.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{RequestKey, ResponseStore};
use crate::config::CacheConfig;
use crate::event::{EventStream, LifecycleEvent};
use crate::intercept::{InterceptRequest, Upstream};

/// Control message that promotes a waiting generation.
pub const SKIP_WAITING: &str = "skipWaiting";
/// Control message that consumes the "update available" signal.
pub const ACK_UPDATE: &str = "ackUpdate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  /// Installed and waiting behind an active generation
  Installed,
  Activating,
  Active,
  /// Superseded or failed to install
  Redundant,
}

#[derive(Debug, Default)]
struct Inner {
  active: Option<String>,
  waiting: Option<String>,
  states: HashMap<String, GenerationState>,
  update_available: bool,
}

impl Inner {
  fn set_state(&mut self, tag: &str, state: GenerationState) {
    debug!(generation = tag, ?state, "generation state change");
    self.states.insert(tag.to_string(), state);
  }
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LifecycleStatus {
  pub active: Option<String>,
  pub waiting: Option<String>,
  pub update_available: bool,
}

/// Install/activate/update state machine for cache generations.
pub struct LifecycleController<S: ResponseStore, U: Upstream> {
  store: Arc<S>,
  upstream: Arc<U>,
  origin: Url,
  manifest: Vec<String>,
  skip_waiting: bool,
  inner: Mutex<Inner>,
  /// Serialises install/activate/promote
  transition: tokio::sync::Mutex<()>,
  current: watch::Sender<String>,
  events: broadcast::Sender<LifecycleEvent>,
}

impl<S: ResponseStore, U: Upstream> LifecycleController<S, U> {
  /// Create a controller, resuming the generation that was active last run.
  pub fn new(store: Arc<S>, upstream: Arc<U>, origin: Url, config: &CacheConfig) -> Result<Self> {
    let mut inner = Inner::default();
    let restored = store.active_generation()?;
    if let Some(tag) = &restored {
      inner.set_state(tag, GenerationState::Active);
      inner.active = Some(tag.clone());
    }

    let current = restored.unwrap_or_else(|| config.generation.clone());
    let (current, _) = watch::channel(current);
    let (events, _) = broadcast::channel(32);

    Ok(Self {
      store,
      upstream,
      origin,
      manifest: config.precache.clone(),
      skip_waiting: config.skip_waiting,
      inner: Mutex::new(inner),
      transition: tokio::sync::Mutex::new(()),
      current,
      events,
    })
  }

  fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn emit(&self, event: LifecycleEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  /// Follow the generation new cache entries should be written to.
  pub fn generation_watch(&self) -> watch::Receiver<String> {
    self.current.subscribe()
  }

  pub fn current_generation(&self) -> String {
    self.current.borrow().clone()
  }

  pub fn subscribe(&self) -> EventStream {
    EventStream::new(self.events.subscribe())
  }

  #[cfg(test)]
  pub fn state_of(&self, tag: &str) -> Option<GenerationState> {
    self.inner().ok()?.states.get(tag).copied()
  }

  pub fn status(&self) -> Result<LifecycleStatus> {
    let inner = self.inner()?;
    Ok(LifecycleStatus {
      active: inner.active.clone(),
      waiting: inner.waiting.clone(),
      update_available: inner.update_available,
    })
  }

  /// Whether a new generation is waiting. Does not consume the signal.
  #[cfg(test)]
  pub fn update_available(&self) -> bool {
    self.inner().map(|i| i.update_available).unwrap_or(false)
  }

  /// Read and clear the one-shot update signal.
  pub fn take_update_available(&self) -> bool {
    self
      .inner()
      .map(|mut i| std::mem::take(&mut i.update_available))
      .unwrap_or(false)
  }

  /// Register generation `tag`: installs it unless it is already active or waiting.
  pub async fn register(&self, tag: &str) -> Result<GenerationState> {
    let _guard = self.transition.lock().await;

    {
      let inner = self.inner()?;
      if inner.active.as_deref() == Some(tag) || inner.waiting.as_deref() == Some(tag) {
        debug!(generation = tag, "already registered");
        return Ok(inner.states[tag]);
      }
    }

    self.on_install(tag).await?;

    let has_active = self.inner()?.active.is_some();
    if !has_active {
      self.on_activate(tag)?;
      return Ok(GenerationState::Active);
    }

    {
      let mut inner = self.inner()?;
      if let Some(previous) = inner.waiting.replace(tag.to_string()) {
        inner.set_state(&previous, GenerationState::Redundant);
      }
      inner.update_available = true;
    }
    info!(generation = tag, "update available");
    self.emit(LifecycleEvent::UpdateAvailable(tag.to_string()));

    if self.skip_waiting {
      self.promote_waiting()?;
      return Ok(GenerationState::Active);
    }

    Ok(GenerationState::Installed)
  }

  /// Precache the manifest into the generation's cache. All or nothing: a
  /// failed or non-2xx fetch discards the generation.
  async fn on_install(&self, tag: &str) -> Result<()> {
    self.inner()?.set_state(tag, GenerationState::Installing);

    match self.precache(tag).await {
      Ok(count) => {
        self.inner()?.set_state(tag, GenerationState::Installed);
        info!(generation = tag, resources = count, "installed");
        self.emit(LifecycleEvent::Installed(tag.to_string()));
        Ok(())
      }
      Err(e) => {
        if let Err(cleanup) = self.store.delete_named(tag) {
          warn!(generation = tag, error = %cleanup, "failed to discard partial cache");
        }
        self.inner()?.set_state(tag, GenerationState::Redundant);
        warn!(generation = tag, error = %e, "install failed");
        self.emit(LifecycleEvent::InstallFailed(tag.to_string()));
        Err(e)
      }
    }
  }

  async fn precache(&self, tag: &str) -> Result<usize> {
    let mut fetched = Vec::with_capacity(self.manifest.len());
    for path in &self.manifest {
      let url = self
        .origin
        .join(path)
        .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))?;
      let request = InterceptRequest::get(url);
      let response = self.upstream.fetch(&request).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Precache of {} failed with status {}",
          request.url,
          response.status
        ));
      }
      fetched.push((request.key(), response));
    }

    self.store.open_named(tag)?;
    for (key, response) in &fetched {
      self.store.put(tag, key, response)?;
    }
    Ok(fetched.len())
  }

  /// Make `tag` the only live generation.
  fn on_activate(&self, tag: &str) -> Result<()> {
    self.inner()?.set_state(tag, GenerationState::Activating);

    let deleted = self.store.retain_only(tag)?;
    if !deleted.is_empty() {
      info!(generation = tag, deleted = ?deleted, "swept old caches");
    }
    self.store.set_active_generation(tag)?;

    {
      let mut inner = self.inner()?;
      if let Some(previous) = inner.active.replace(tag.to_string()) {
        if previous != tag {
          inner.set_state(&previous, GenerationState::Redundant);
        }
      }
      if inner.waiting.as_deref() == Some(tag) {
        inner.waiting = None;
        inner.update_available = false;
      }
      inner.set_state(tag, GenerationState::Active);
    }

    self.current.send_replace(tag.to_string());
    info!(generation = tag, "activated");
    self.emit(LifecycleEvent::Activated(tag.to_string()));
    Ok(())
  }

  fn promote_waiting(&self) -> Result<bool> {
    let waiting = self.inner()?.waiting.clone();
    let Some(tag) = waiting else {
      return Ok(false);
    };

    self.on_activate(&tag)?;
    self.emit(LifecycleEvent::ControllerChange(tag));
    Ok(true)
  }

  /// Promote the waiting generation, if any. Subscribers receive
  /// `ControllerChange` and should reload.
  pub async fn promote(&self) -> Result<bool> {
    let _guard = self.transition.lock().await;
    self.promote_waiting()
  }

  /// Handle a control message from a client. Returns whether it had an
  /// effect: a generation was promoted, or a pending update signal consumed.
  pub async fn on_control_message(&self, message: &str) -> Result<bool> {
    match message.trim() {
      SKIP_WAITING => self.promote().await,
      ACK_UPDATE => Ok(self.take_update_available()),
      other => {
        debug!(message = other, "ignoring unknown control message");
        Ok(false)
      }
    }
  }
}
