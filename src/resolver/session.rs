use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Resolver;
use crate::{
  decoder,
  error::{ResolutionError, Stage},
  util::{cancellable, sleep_cancellable},
};

// The session token is split across several `ck('_wp_http_N', '...')` calls.
static SESSION_FRAGMENT: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"ck\('_wp_http_\d+','([^']+)'").unwrap());

const INVALID_REQUEST: &str = "Invalid Request";

#[derive(Deserialize)]
struct SessionPayload {
  data: Value,
  wp_http1: String,
}

impl SessionPayload {
  fn blog_url(&self) -> String {
    let data = match &self.data {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    };
    format!("{}?re={}", self.wp_http1, decoder::encode_base64(&data))
  }
}

impl Resolver {
  /// Obtains the session blog page behind `link`.
  ///
  /// Upstream only issues the session after a short delay, answering
  /// "Invalid Request" until then, so the blog url is polled a bounded
  /// number of times.
  pub(super) async fn establish_session(
    &self,
    link: &str,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let page = self.fetch(link, Stage::Session, signal).await?;
    let token: String = SESSION_FRAGMENT
      .captures_iter(&page)
      .map(|c| c[1].to_string())
      .collect();
    if token.is_empty() {
      return Err(ResolutionError::NoTokenFound(Stage::Session));
    }

    let payload: SessionPayload = decoder::decode(&token)?;
    let blog = payload.blog_url();
    debug!(%blog, "session token decoded");

    if !sleep_cancellable(signal, self.config.session_grace).await {
      return Err(ResolutionError::Cancelled);
    }

    let attempts = self.config.session_poll_attempts.max(1);
    for attempt in 1..=attempts {
      let body = self.fetch_body(&blog, signal).await?;
      if !body.contains(INVALID_REQUEST) {
        return Ok(body);
      }

      debug!(attempt, "session not issued yet");
      if attempt < attempts
        && !sleep_cancellable(signal, self.config.session_poll_interval).await
      {
        return Err(ResolutionError::Cancelled);
      }
    }

    warn!(%blog, attempts, "session was never issued");
    Err(ResolutionError::SessionTimeout { attempts })
  }

  // The rejection page may come with an error status, so only transport
  // failures count here.
  async fn fetch_body(
    &self,
    url: &str,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let request = async { self.client.get(url).send().await?.text().await };

    cancellable(signal, request)
      .await
      .ok_or(ResolutionError::Cancelled)?
      .map_err(|source| ResolutionError::Fetch {
        stage: Stage::SessionBlog,
        source,
      })
  }
}

#[cfg(test)]
mod test {
  use std::time::Duration;

  use serde_json::json;
  use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;
  use crate::{
    decoder::encode_chain,
    resolver::test::{quick_config, resolver},
  };

  async fn session_server(blog_status: u16, blog_body: &str) -> MockServer {
    let server = MockServer::start().await;
    let token = encode_chain(
      &json!({
        "data": {"id": 7},
        "wp_http1": format!("{}/blog", server.uri()),
      })
      .to_string(),
    );
    Mock::given(method("GET"))
      .and(path("/session"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_string(format!("ck('_wp_http_1','{token}')")),
      )
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/blog"))
      .respond_with(
        ResponseTemplate::new(blog_status).set_body_string(blog_body),
      )
      .mount(&server)
      .await;
    server
  }

  #[test]
  fn test_blog_url() {
    let payload = SessionPayload {
      data: json!("abc"),
      wp_http1: "https://blog.example/".into(),
    };
    assert_eq!(payload.blog_url(), "https://blog.example/?re=YWJj");

    let payload = SessionPayload {
      data: json!({"id": 7}),
      wp_http1: "https://blog.example/".into(),
    };
    let expected = decoder::encode_base64(r#"{"id":7}"#);
    assert_eq!(
      payload.blog_url(),
      format!("https://blog.example/?re={expected}")
    );
  }

  #[tokio::test]
  async fn test_session_gives_up_after_bounded_polls() {
    let server = session_server(403, "Invalid Request").await;

    let err = resolver(quick_config())
      .establish_session(
        &format!("{}/session", server.uri()),
        &CancellationToken::new(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ResolutionError::SessionTimeout { attempts: 3 }));

    let polls = server
      .received_requests()
      .await
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == "/blog")
      .count();
    assert_eq!(polls, 3);
  }

  #[tokio::test]
  async fn test_session_issued() {
    let server = session_server(200, "<h3>1080p</h3>").await;

    let body = resolver(quick_config())
      .establish_session(
        &format!("{}/session", server.uri()),
        &CancellationToken::new(),
      )
      .await
      .unwrap();
    assert_eq!(body, "<h3>1080p</h3>");
  }

  #[tokio::test]
  async fn test_session_without_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/session"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<p>hi</p>"))
      .mount(&server)
      .await;

    let err = resolver(quick_config())
      .establish_session(
        &format!("{}/session", server.uri()),
        &CancellationToken::new(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ResolutionError::NoTokenFound(Stage::Session)));
  }

  #[tokio::test]
  async fn test_cancel_during_grace_period() {
    let server = session_server(200, "ok").await;
    let mut config = quick_config();
    config.session_grace = Duration::from_secs(30);

    let signal = CancellationToken::new();
    let canceller = signal.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      canceller.cancel();
    });

    let err = resolver(config)
      .establish_session(&format!("{}/session", server.uri()), &signal)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolutionError::Cancelled));
  }
}
