mod hops;
mod page;

use futures::StreamExt;
use itertools::Itertools;
use reqwest::header;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
  config::{ExtractorConfig, USER_AGENT},
  error::{ResolutionError, Stage},
  util::cancellable,
};

pub use page::{is_media_url, scan_page, Button, PageScan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateLink {
  pub quality: String,
  pub url: String,
  #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
  pub media_type: Option<String>,
}

impl CandidateLink {
  pub fn new(quality: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      quality: quality.into(),
      url: url.into(),
      media_type: None,
    }
  }
}

/// Scrapes delivery-intermediary pages for direct media links.
#[derive(Clone)]
pub struct Extractor {
  client: reqwest::Client,
  config: ExtractorConfig,
  media_extensions: Vec<String>,
}

impl Extractor {
  pub fn new(
    client: reqwest::Client,
    config: ExtractorConfig,
    media_extensions: Vec<String>,
  ) -> Self {
    Self {
      client,
      config,
      media_extensions,
    }
  }

  /// Candidates are returned in discovery order, deduplicated by url. A page
  /// offering nothing better than itself yields a single "direct" candidate.
  pub async fn extract(
    &self,
    url: &str,
    signal: &CancellationToken,
  ) -> Result<Vec<CandidateLink>, ResolutionError> {
    let html = self.fetch(url, Stage::Intermediary, signal).await?;
    let PageScan { mut media, buttons } =
      scan_page(&html, &self.media_extensions);

    debug!(
      url,
      media = media.len(),
      buttons = buttons.len(),
      "scanned intermediary page"
    );

    let followed: Vec<CandidateLink> = futures::stream::iter(buttons)
      .map(|button| self.follow_button(button, signal))
      .buffered(self.config.hop_concurrency.max(1))
      .filter_map(futures::future::ready)
      .collect()
      .await;

    if signal.is_cancelled() {
      return Err(ResolutionError::Cancelled);
    }

    media.extend(followed);
    let mut candidates: Vec<_> =
      media.into_iter().unique_by(|c| c.url.clone()).collect();

    if candidates.is_empty() {
      candidates.push(CandidateLink::new("direct", url));
    }

    info!(url, count = candidates.len(), "extracted stream candidates");
    Ok(candidates)
  }

  fn is_intermediary(&self, url: &str) -> bool {
    self
      .config
      .intermediary_hosts
      .iter()
      .any(|host| url.contains(host.as_str()))
  }

  async fn fetch(
    &self,
    url: &str,
    stage: Stage,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let request = async {
      self
        .client
        .get(url)
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::REFERER, &self.config.referer)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
    };

    cancellable(signal, request)
      .await
      .ok_or(ResolutionError::Cancelled)?
      .map_err(|source| ResolutionError::Fetch { stage, source })
  }
}
