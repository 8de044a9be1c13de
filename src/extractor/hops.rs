use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Button, CandidateLink, Extractor};
use crate::{
  error::{ResolutionError, Stage},
  W,
};

const MAX_HOPS: usize = 2;

// Labels that mark the useful link on an intermediary page, best first.
const HOP_LABELS: [&str; 8] = [
  "Drive", "Instant", "Watch", "Download", "10Gbps", "1080p", "720p", "480p",
];

impl Extractor {
  /// Resolves one download button. A failed hop drops the branch instead of
  /// failing the whole extraction.
  pub(super) async fn follow_button(
    &self,
    button: Button,
    signal: &CancellationToken,
  ) -> Option<CandidateLink> {
    if !self.is_intermediary(&button.href) {
      return Some(CandidateLink::new(button.quality, button.href));
    }

    match self.follow_hops(&button.href, signal).await {
      Ok(url) => Some(CandidateLink::new(button.quality, url)),
      Err(e) => {
        debug!(href = %button.href, "dropping download button: {}", e);
        None
      }
    }
  }

  async fn follow_hops(
    &self,
    href: &str,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let mut current = href.to_string();

    for _ in 0..MAX_HOPS {
      let html = self.fetch(&current, Stage::Hop, signal).await?;
      match pick_anchor(&html) {
        Some(next) if self.is_intermediary(&next) => current = next,
        Some(next) => return Ok(next),
        // a hop page without links means the link itself is the download
        None => return Ok(current),
      }
    }

    Ok(current)
  }
}

fn pick_anchor(html: &str) -> Option<String> {
  let dom = tl::parse(html, tl::ParserOptions::default()).ok()?;
  let anchors = W(&dom).elements(&["a"]);
  let anchors: Vec<_> = anchors
    .iter()
    .filter_map(|el| Some((el.http_href()?, el.text.as_str())))
    .collect();

  HOP_LABELS
    .iter()
    .find_map(|label| anchors.iter().find(|(_, text)| text.contains(label)))
    .or_else(|| anchors.first())
    .map(|(href, _)| href.to_string())
}

#[cfg(test)]
mod test {
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;
  use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;

  #[test]
  fn test_pick_anchor_prefers_labels() {
    let html = r#"
      <a href="https://x.example/1">Mirror</a>
      <a href="https://x.example/2">Download Now</a>
      <a href="https://x.example/3">Google Drive</a>
    "#;
    assert_eq!(pick_anchor(html).as_deref(), Some("https://x.example/3"));

    let html =
      r##"<a href="#">Back</a><a href="https://x.example/1">Mirror</a>"##;
    assert_eq!(pick_anchor(html).as_deref(), Some("https://x.example/1"));

    assert_eq!(pick_anchor("<p>empty</p>"), None);
  }

  #[tokio::test]
  async fn test_two_hops() {
    let server = MockServer::start().await;
    let uri = server.uri();
    Mock::given(method("GET"))
      .and(path("/hop/1"))
      .respond_with(ResponseTemplate::new(200).set_body_string(format!(
        r#"<a href="{uri}/hop/2">Download [Server : 10Gbps]</a>"#
      )))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/hop/2"))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"<a href="https://files.example/final.mkv">Download Here</a>"#,
      ))
      .mount(&server)
      .await;

    let extractor = super::super::test::extractor_for(&server);
    let button = Button {
      quality: "1080p".into(),
      href: format!("{uri}/hop/1"),
    };
    let found = extractor
      .follow_button(button, &CancellationToken::new())
      .await;

    assert_eq!(
      found,
      Some(CandidateLink::new("1080p", "https://files.example/final.mkv"))
    );
  }

  #[tokio::test]
  async fn test_hop_without_links_keeps_link() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/hop/1"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<p>wait</p>"))
      .mount(&server)
      .await;

    let extractor = super::super::test::extractor_for(&server);
    let href = format!("{}/hop/1", server.uri());
    let found = extractor
      .follow_button(
        Button {
          quality: "HD".into(),
          href: href.clone(),
        },
        &CancellationToken::new(),
      )
      .await;

    assert_eq!(found, Some(CandidateLink::new("HD", href)));
  }

  #[tokio::test]
  async fn test_cancel_while_hop_in_flight() {
    let server = MockServer::start().await;
    let uri = server.uri();
    Mock::given(method("GET"))
      .and(path("/page"))
      .respond_with(ResponseTemplate::new(200).set_body_string(format!(
        r#"<a href="{uri}/hop/slow">Download 1080p</a>"#
      )))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/hop/slow"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_string("<p>late</p>")
          .set_delay(Duration::from_secs(10)),
      )
      .mount(&server)
      .await;

    let signal = CancellationToken::new();
    tokio::spawn({
      let signal = signal.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.cancel();
      }
    });

    let extractor = super::super::test::extractor_for(&server);
    let res = tokio::time::timeout(
      Duration::from_secs(2),
      extractor.extract(&format!("{uri}/page"), &signal),
    )
    .await
    .expect("extraction should stop once cancelled");
    assert!(matches!(res, Err(ResolutionError::Cancelled)));
  }
}
