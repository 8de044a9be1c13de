use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{ChildStdout, Command},
  sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AcquireError;

const ARCHIVE_LISTING_TIMEOUT: Duration = Duration::from_secs(30);

/// What a delivery process is told on its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
  pub source_url: String,
  pub bind_port: u16,
  pub host: String,
  pub archive_member: Option<String>,
}

impl LaunchArgs {
  pub fn to_args(&self) -> Vec<String> {
    let mut args = vec![
      "--url".to_string(),
      self.source_url.clone(),
      "--port".to_string(),
      self.bind_port.to_string(),
      "--host".to_string(),
      self.host.clone(),
    ];
    if let Some(member) = &self.archive_member {
      args.push("--zip-file".to_string());
      args.push(member.clone());
    }
    args
  }
}

/// A freshly started delivery process together with its stdout lines.
pub struct Launched {
  pub process: Arc<dyn DeliveryProcess>,
  /// Ends when the process closes stdout.
  pub events: BoxStream<'static, String>,
}

#[async_trait]
pub trait DeliveryLauncher: Send + Sync {
  async fn start(&self, args: &LaunchArgs) -> Result<Launched, AcquireError>;
}

/// Handle to a running delivery process, shared by the registry and its
/// supervisor.
#[async_trait]
pub trait DeliveryProcess: Send + Sync {
  fn id(&self) -> Option<u32>;

  /// Forceful termination. Returns immediately.
  fn kill(&self);

  /// Resolves with the exit code once the process is gone.
  async fn wait(&self) -> Option<i32>;
}

/// Spawns the configured delivery program as a child process.
pub struct CommandLauncher {
  program: String,
  args: Vec<String>,
}

impl CommandLauncher {
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }
}

#[async_trait]
impl DeliveryLauncher for CommandLauncher {
  async fn start(&self, launch: &LaunchArgs) -> Result<Launched, AcquireError> {
    let mut cmd = Command::new(&self.program);
    cmd
      .args(&self.args)
      .args(launch.to_args())
      .stdin(Stdio::null())
      // status events arrive on stdout
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      // last resort if the orchestrator itself goes away
      .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
      AcquireError::SpawnFailed(format!("{}: {}", self.program, e))
    })?;

    let id = child.id();
    let events = match child.stdout.take() {
      Some(stdout) => stdout_lines(stdout),
      None => futures::stream::empty().boxed(),
    };
    let kill = CancellationToken::new();
    let (exit_tx, exit) = watch::channel(None);

    let killed = kill.clone();
    tokio::spawn(async move {
      let status = tokio::select! {
        status = child.wait() => status,
        _ = killed.cancelled() => {
          if let Err(e) = child.start_kill() {
            debug!(?id, "kill failed: {}", e);
          }
          child.wait().await
        }
      };

      let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
          warn!(?id, "failed to wait for delivery process: {}", e);
          None
        }
      };
      debug!(?id, ?code, "delivery process exited");
      exit_tx.send_replace(Some(code));
    });

    Ok(Launched {
      process: Arc::new(ChildProcess { id, kill, exit }),
      events,
    })
  }
}

struct ChildProcess {
  id: Option<u32>,
  kill: CancellationToken,
  exit: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl DeliveryProcess for ChildProcess {
  fn id(&self) -> Option<u32> {
    self.id
  }

  fn kill(&self) {
    self.kill.cancel();
  }

  async fn wait(&self) -> Option<i32> {
    let mut exit = self.exit.clone();
    let code = match exit.wait_for(Option::is_some).await {
      Ok(code) => *code,
      Err(_) => None,
    };
    code.flatten()
  }
}

fn stdout_lines(stdout: ChildStdout) -> BoxStream<'static, String> {
  let lines = BufReader::new(stdout).lines();
  futures::stream::unfold(lines, |mut lines| async move {
    match lines.next_line().await {
      Ok(Some(line)) => Some((line, lines)),
      Ok(None) => None,
      Err(e) => {
        debug!("stdout closed: {}", e);
        None
      }
    }
  })
  .boxed()
}

/// Asks the archive helper which member of a remote archive to stream.
/// Any failure just means no member is passed along.
pub async fn archive_member(helper: &[String], url: &str) -> Option<String> {
  let (program, args) = helper.split_first()?;
  let mut cmd = Command::new(program);
  cmd
    .args(args)
    .arg("list")
    .arg("--url")
    .arg(url)
    .stdin(Stdio::null())
    .kill_on_drop(true);

  let output = match tokio::time::timeout(ARCHIVE_LISTING_TIMEOUT, cmd.output())
    .await
  {
    Ok(Ok(output)) if output.status.success() => output,
    Ok(Ok(output)) => {
      warn!(url, code = ?output.status.code(), "archive helper failed");
      return None;
    }
    Ok(Err(e)) => {
      warn!(url, "failed to run archive helper: {}", e);
      return None;
    }
    Err(_) => {
      warn!(url, "archive helper timed out");
      return None;
    }
  };

  match serde_json::from_slice::<Vec<String>>(&output.stdout) {
    Ok(members) => members.into_iter().next(),
    Err(e) => {
      warn!(url, "unreadable archive listing: {}", e);
      None
    }
  }
}
