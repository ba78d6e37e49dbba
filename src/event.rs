use tokio::sync::broadcast;

/// Lifecycle events, tagged with the generation they concern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Precache finished
  Installed(String),
  /// Precache failed; the generation was discarded
  InstallFailed(String),
  /// A new generation is waiting behind the active one
  UpdateAvailable(String),
  /// Old generations were swept and this one now serves
  Activated(String),
  /// A waiting generation was promoted; open clients should reload
  ControllerChange(String),
}

impl LifecycleEvent {
  /// Event name used on the wire (server-sent events).
  pub fn name(&self) -> &'static str {
    match self {
      LifecycleEvent::Installed(_) => "installed",
      LifecycleEvent::InstallFailed(_) => "installfailed",
      LifecycleEvent::UpdateAvailable(_) => "updatefound",
      LifecycleEvent::Activated(_) => "activated",
      LifecycleEvent::ControllerChange(_) => "controllerchange",
    }
  }

  pub fn generation(&self) -> &str {
    match self {
      LifecycleEvent::Installed(g)
      | LifecycleEvent::InstallFailed(g)
      | LifecycleEvent::UpdateAvailable(g)
      | LifecycleEvent::Activated(g)
      | LifecycleEvent::ControllerChange(g) => g,
    }
  }
}

/// Subscriber side of the lifecycle event bus
pub struct EventStream {
  rx: broadcast::Receiver<LifecycleEvent>,
}

impl EventStream {
  pub fn new(rx: broadcast::Receiver<LifecycleEvent>) -> Self {
    Self { rx }
  }

  /// Receive the next event. Events missed by a slow subscriber are skipped;
  /// `None` once the controller is gone.
  pub async fn next(&mut self) -> Option<LifecycleEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          tracing::debug!(missed, "lifecycle subscriber lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}
