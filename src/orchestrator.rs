//! Reference-counted lifecycle of delivery processes, one per source.
//!
//! A source goes `absent → starting → ready → absent`. While starting,
//! every caller for the same source awaits one shared startup future, so a
//! burst of viewers never spawns more than one process. Once ready, viewers
//! join and leave the binding; the last one out stops the process.

mod process;

use std::{
  collections::{hash_map::Entry, HashMap},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{
  future::{BoxFuture, Shared},
  stream::BoxStream,
  FutureExt, StreamExt,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::OrchestratorConfig, error::AcquireError};

pub use process::{
  CommandLauncher, DeliveryLauncher, DeliveryProcess, LaunchArgs, Launched,
};

const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const UNTRACKED_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type Startup = Shared<BoxFuture<'static, Result<Bound, AcquireError>>>;

/// Where a ready delivery process can be reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
  pub port: u16,
  pub duration: Option<f64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
  /// Other viewers remain; the process keeps running.
  Retained(u32),
  Stopped,
  /// Nothing was registered on the port; a stop request was sent anyway.
  Untracked,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StatusEvent {
  Bound {
    port: u16,
    #[serde(default)]
    duration: Option<f64>,
  },
  #[serde(other)]
  Other,
}

fn parse_bound(line: &str) -> Option<Bound> {
  let line = line.trim();
  if !line.starts_with('{') {
    return None;
  }

  match serde_json::from_str(line) {
    Ok(StatusEvent::Bound { port, duration }) => Some(Bound { port, duration }),
    _ => None,
  }
}

struct ProxyBinding {
  port: u16,
  process: Arc<dyn DeliveryProcess>,
  viewers: u32,
  duration: Option<f64>,
  last_accessed: DateTime<Utc>,
  generation: u64,
}

struct Pending {
  startup: Startup,
  generation: u64,
  // callers currently awaiting the startup; they become the binding's viewers
  viewers: u32,
}

#[derive(Default)]
struct Registry {
  bindings: HashMap<String, ProxyBinding>,
  starting: HashMap<String, Pending>,
}

enum Released {
  Retained(u32),
  Stopped(ProxyBinding),
  Untracked,
}

impl Registry {
  fn join(&mut self, source: &str) -> Option<Bound> {
    let binding = self.bindings.get_mut(source)?;
    binding.viewers += 1;
    binding.last_accessed = Utc::now();
    Some(Bound {
      port: binding.port,
      duration: binding.duration,
    })
  }

  fn release(&mut self, port: u16) -> Released {
    let Some(source) = self
      .bindings
      .iter()
      .find(|(_, b)| b.port == port)
      .map(|(source, _)| source.clone())
    else {
      return Released::Untracked;
    };

    let Some(binding) = self.bindings.get_mut(&source) else {
      return Released::Untracked;
    };
    binding.viewers = binding.viewers.saturating_sub(1);
    binding.last_accessed = Utc::now();
    if binding.viewers > 0 {
      return Released::Retained(binding.viewers);
    }

    // gone from the registry before the process is touched, so nobody can
    // join a dying stream
    match self.bindings.remove(&source) {
      Some(binding) => Released::Stopped(binding),
      None => Released::Untracked,
    }
  }
}

#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

struct Inner {
  launcher: Arc<dyn DeliveryLauncher>,
  config: OrchestratorConfig,
  client: reqwest::Client,
  registry: Mutex<Registry>,
  closing: CancellationToken,
  generation: AtomicU64,
}

impl Orchestrator {
  pub fn new(
    launcher: Arc<dyn DeliveryLauncher>,
    config: OrchestratorConfig,
    client: reqwest::Client,
  ) -> Self {
    let inner = Inner {
      launcher,
      config,
      client,
      registry: Mutex::default(),
      closing: CancellationToken::new(),
      generation: AtomicU64::new(0),
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    // the registry stays consistent between statements, so a panic elsewhere
    // doesn't invalidate it
    self
      .inner
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Joins the running delivery process for `source`, starting one if
  /// needed. Each successful call accounts for one viewer.
  pub async fn acquire(&self, source: &str) -> Result<Bound, AcquireError> {
    let mut waited_on_failure = false;

    loop {
      if self.inner.closing.is_cancelled() {
        return Err(AcquireError::ShuttingDown);
      }

      let (startup, generation, initiator) = {
        let mut registry = self.registry();
        if let Some(bound) = registry.join(source) {
          debug!(source, port = bound.port, "reusing delivery process");
          return Ok(bound);
        }

        let (pending, initiator) =
          match registry.starting.entry(source.to_string()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
              let generation =
                self.inner.generation.fetch_add(1, Ordering::Relaxed);
              let pending = Pending {
                startup: self.start(source.to_string(), generation),
                generation,
                viewers: 0,
              };
              (entry.insert(pending), true)
            }
          };
        pending.viewers += 1;
        (pending.startup.clone(), pending.generation, initiator)
      };

      if !initiator {
        debug!(source, "waiting for delivery process startup");
      }
      let waiting = Waiting::arm(self.clone(), source, generation);
      let res = startup.await;
      waiting.disarm();

      match res {
        // counted when the binding was created
        Ok(bound) => return Ok(bound),
        Err(e) if initiator || waited_on_failure => return Err(e),
        Err(e) => {
          warn!(source, "startup by another caller failed, retrying: {}", e);
          waited_on_failure = true;
        }
      }
    }
  }

  // Runs detached so that a caller going away doesn't abort the startup the
  // other waiters depend on.
  fn start(&self, source: String, generation: u64) -> Startup {
    let this = self.clone();
    let task =
      tokio::spawn(async move { this.run_startup(source, generation).await });

    async move {
      task
        .await
        .unwrap_or_else(|e| Err(AcquireError::Aborted(e.to_string())))
    }
    .boxed()
    .shared()
  }

  async fn run_startup(
    self,
    source: String,
    generation: u64,
  ) -> Result<Bound, AcquireError> {
    let launched = self.launch(&source).await;

    let (bound, process, events, viewers) = {
      let mut registry = self.registry();
      let viewers = match registry.starting.entry(source.clone()) {
        Entry::Occupied(entry) if entry.get().generation == generation => {
          entry.remove().viewers
        }
        _ => 0,
      };

      let (bound, Launched { process, events }) = launched?;
      if self.inner.closing.is_cancelled() {
        process.kill();
        return Err(AcquireError::ShuttingDown);
      }
      if viewers == 0 {
        info!(%source, port = bound.port, "no viewers left, stopping");
        process.kill();
        return Err(AcquireError::Abandoned);
      }

      registry.bindings.insert(
        source.clone(),
        ProxyBinding {
          port: bound.port,
          process: process.clone(),
          viewers,
          duration: bound.duration,
          last_accessed: Utc::now(),
          generation,
        },
      );
      (bound, process, events, viewers)
    };

    info!(
      %source,
      port = bound.port,
      duration = ?bound.duration,
      viewers,
      "delivery process ready"
    );
    let supervisor = self.clone();
    tokio::spawn(supervisor.supervise(source, generation, process, events));
    Ok(bound)
  }

  async fn launch(
    &self,
    source: &str,
  ) -> Result<(Bound, Launched), AcquireError> {
    let config = &self.inner.config;
    let archive_member = match &config.archive_helper {
      Some(helper) if source.to_lowercase().contains(".zip") => {
        process::archive_member(helper, source).await
      }
      _ => None,
    };

    let args = LaunchArgs {
      source_url: source.to_string(),
      bind_port: config.base_port,
      host: config.host.clone(),
      archive_member,
    };
    info!(
      source,
      port = args.bind_port,
      member = ?args.archive_member,
      "spawning delivery process"
    );

    let Launched {
      process,
      mut events,
    } = self.inner.launcher.start(&args).await?;

    let timeout = config.startup_timeout;
    let ready = async {
      while let Some(line) = events.next().await {
        match parse_bound(&line) {
          Some(bound) => return Ok(bound),
          None => debug!(source, "delivery: {}", line),
        }
      }
      // stdout closed before readiness
      Err(AcquireError::ProcessExited(process.wait().await))
    };

    let outcome = tokio::select! {
      biased;
      _ = self.inner.closing.cancelled() => Err(AcquireError::ShuttingDown),
      res = tokio::time::timeout(timeout, ready) => {
        res.unwrap_or(Err(AcquireError::Timeout(timeout)))
      }
    };

    match outcome {
      Ok(bound) => Ok((bound, Launched { process, events })),
      Err(e) => {
        warn!(
          source,
          pid = ?process.id(),
          "delivery process failed to start: {}", e
        );
        process.kill();
        Err(e)
      }
    }
  }

  // Keeps stdout drained for the life of the process and drops the binding
  // once the process exits on its own.
  async fn supervise(
    self,
    source: String,
    generation: u64,
    process: Arc<dyn DeliveryProcess>,
    events: BoxStream<'static, String>,
  ) {
    events
      .for_each(|line| async move { debug!("delivery: {}", line) })
      .await;
    let code = process.wait().await;

    let mut registry = self.registry();
    let current = registry
      .bindings
      .get(&source)
      .map_or(false, |b| b.generation == generation);
    if current {
      registry.bindings.remove(&source);
      info!(%source, ?code, "delivery process exited, binding dropped");
    }
  }

  /// Accounts for one viewer leaving the stream on `port`. Never fails.
  pub async fn release(&self, port: u16) -> ReleaseOutcome {
    let released = self.registry().release(port);

    match released {
      Released::Retained(viewers) => {
        info!(port, viewers, "viewer left, delivery process kept");
        ReleaseOutcome::Retained(viewers)
      }
      Released::Stopped(binding) => {
        info!(
          port,
          pid = ?binding.process.id(),
          "last viewer left, stopping delivery process"
        );
        binding.process.kill();
        self.request_stop(port, STOP_REQUEST_TIMEOUT).await;
        ReleaseOutcome::Stopped
      }
      Released::Untracked => {
        debug!(port, "release for untracked port");
        self.request_stop(port, UNTRACKED_STOP_TIMEOUT).await;
        ReleaseOutcome::Untracked
      }
    }
  }

  async fn request_stop(&self, port: u16, timeout: Duration) {
    let url = format!(
      "http://{}:{}/shutdown",
      self.inner.config.control_host, port
    );
    let res = self.inner.client.post(&url).timeout(timeout).send().await;
    if let Err(e) = res {
      debug!(port, "stop request failed: {}", e);
    }
  }

  /// Stops every delivery process regardless of viewers and fails any
  /// startup in flight. Later `acquire` calls fail with `ShuttingDown`.
  pub fn shutdown_all(&self) {
    self.inner.closing.cancel();

    let bindings: Vec<_> = self.registry().bindings.drain().collect();
    for (source, binding) in bindings {
      info!(
        %source,
        port = binding.port,
        viewers = binding.viewers,
        last_accessed = %binding.last_accessed,
        "stopping delivery process"
      );
      binding.process.kill();
    }
  }
}

// Takes a caller's viewer back when it stops waiting for a startup, so a
// client that disconnected early never keeps a process alive.
struct Waiting {
  orchestrator: Option<Orchestrator>,
  source: String,
  generation: u64,
}

impl Waiting {
  fn arm(orchestrator: Orchestrator, source: &str, generation: u64) -> Self {
    Self {
      orchestrator: Some(orchestrator),
      source: source.to_string(),
      generation,
    }
  }

  fn disarm(mut self) {
    self.orchestrator = None;
  }
}

impl Drop for Waiting {
  fn drop(&mut self) {
    let Some(orchestrator) = self.orchestrator.take() else {
      return;
    };

    let port = {
      let mut registry = orchestrator.registry();
      if let Some(pending) = registry
        .starting
        .get_mut(&self.source)
        .filter(|p| p.generation == self.generation)
      {
        pending.viewers = pending.viewers.saturating_sub(1);
        debug!(source = %self.source, "viewer left during startup");
        return;
      }

      // the startup finished first and already counted this caller
      registry
        .bindings
        .get(&self.source)
        .filter(|b| b.generation == self.generation)
        .map(|b| b.port)
    };

    let (Some(port), Ok(runtime)) =
      (port, tokio::runtime::Handle::try_current())
    else {
      return;
    };
    runtime.spawn(async move {
      orchestrator.release(port).await;
    });
  }
}
