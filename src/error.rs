use std::{fmt, time::Duration};

use axum::{
  response::{IntoResponse, Response},
  Json,
};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{error, warn};

/// Failure to unwrap a redirect token. Never retryable: the same token
/// decodes the same way every time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
  #[error("token is empty")]
  EmptyToken,
  #[error("token is corrupt at the {0} stage")]
  CorruptToken(&'static str),
  #[error("decoded payload has an unexpected shape: {0}")]
  MalformedPayload(String),
}

/// The hop of the resolution chain a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  ContentPage,
  Session,
  SessionBlog,
  Drive,
  Landing,
  Intermediary,
  Hop,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::ContentPage => "content",
      Stage::Session => "session",
      Stage::SessionBlog => "session blog",
      Stage::Drive => "drive",
      Stage::Landing => "landing",
      Stage::Intermediary => "intermediary",
      Stage::Hop => "download hop",
    };
    f.write_str(name)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
  #[error("no redirect token found on the {0} page")]
  NoTokenFound(Stage),
  #[error("no link found on the {0} page")]
  NoLinkFound(Stage),
  #[error("session was not issued after {attempts} attempts")]
  SessionTimeout { attempts: u32 },
  #[error("failed to fetch the {stage} page: {source}")]
  Fetch {
    stage: Stage,
    #[source]
    source: reqwest::Error,
  },
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error("resolution cancelled")]
  Cancelled,
}

/// Failure to bring up a delivery process. Cloned to every caller that
/// waited on the same startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
  #[error("delivery process was not ready within {0:?}")]
  Timeout(Duration),
  #[error("failed to spawn delivery process: {0}")]
  SpawnFailed(String),
  #[error("delivery process exited early with code {}", exit_code(.0))]
  ProcessExited(Option<i32>),
  #[error("server is shutting down")]
  ShuttingDown,
  #[error("delivery startup aborted: {0}")]
  Aborted(String),
  #[error("every viewer left before the delivery process was ready")]
  Abandoned,
}

fn exit_code(code: &Option<i32>) -> String {
  code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
  #[error("Stream proxy not available")]
  ConnectionRefused,
  #[error("Stream not found")]
  NotFound,
  #[error("Upstream error {0}")]
  Upstream(StatusCode),
  #[error("{0}")]
  Transport(String),
}

impl From<reqwest::Error> for DeliveryError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_connect() {
      return DeliveryError::ConnectionRefused;
    }

    match err.status() {
      Some(StatusCode::NOT_FOUND) => DeliveryError::NotFound,
      Some(status) => DeliveryError::Upstream(status),
      None => DeliveryError::Transport(err.to_string()),
    }
  }
}

impl DeliveryError {
  fn status(&self) -> StatusCode {
    match self {
      DeliveryError::ConnectionRefused => StatusCode::SERVICE_UNAVAILABLE,
      DeliveryError::NotFound => StatusCode::NOT_FOUND,
      DeliveryError::Upstream(_) | DeliveryError::Transport(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }

  fn detail(&self) -> &'static str {
    match self {
      DeliveryError::ConnectionRefused => {
        "The stream proxy server is not running on the specified port"
      }
      DeliveryError::NotFound => {
        "The requested HLS segment or playlist does not exist"
      }
      DeliveryError::Upstream(_) | DeliveryError::Transport(_) => {
        "Proxy error"
      }
    }
  }
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Link is required")]
  MissingLink,
  #[error("No streams found")]
  NoStreams,
  #[error("Port parameter is required")]
  MissingPort,
  #[error("Invalid port number")]
  InvalidPort,
  #[error("No file path specified")]
  MissingPath,
  #[error(transparent)]
  Resolution(#[from] ResolutionError),
  #[error(transparent)]
  Acquire(#[from] AcquireError),
  #[error(transparent)]
  Delivery(#[from] DeliveryError),
  #[error(transparent)]
  Http(#[from] http::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    match self {
      Error::MissingLink
      | Error::MissingPort
      | Error::InvalidPort
      | Error::MissingPath => {
        let body = json!({ "error": self.to_string() });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
      }
      Error::NoStreams => {
        let body = json!({ "error": self.to_string() });
        (StatusCode::NOT_FOUND, Json(body)).into_response()
      }
      Error::Delivery(err) => {
        warn!("hls proxy error: {}", err);
        let (error, message) = match &err {
          DeliveryError::Upstream(_) | DeliveryError::Transport(_) => {
            (err.detail().to_string(), err.to_string())
          }
          _ => (err.to_string(), err.detail().to_string()),
        };
        let body = json!({ "error": error, "message": message });
        (err.status(), Json(body)).into_response()
      }
      err => {
        error!("request failed: {}", err);
        let body = json!({ "error": err.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
      }
    }
  }
}
