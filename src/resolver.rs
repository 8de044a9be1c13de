mod session;

use http_types::Url;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
  config::ResolverConfig,
  decoder,
  error::{ResolutionError, Stage},
  extractor::{is_media_url, CandidateLink, Extractor},
  util::cancellable,
  W,
};

static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
  Regex::new(
    r#"(?i)<meta\s+http-equiv="refresh"\s+content="0;\s*url=([^"]+)""#,
  )
  .unwrap()
});

static H3_BLOCK: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?is)<h3[^>]*>(.*?)</h3>").unwrap());

static HREF: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"href="([^"]+)""#).unwrap());

static HUBCLOUD_DRIVE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r#"href="(https://hubcloud\.[^/"]+/drive/[^"]+)""#).unwrap()
});

// The content page hands its token to `s('o', '<token>', 180)`.
const TOKEN_START: &str = "s('o','";
const TOKEN_END: &str = "',180";

const DRIVE_BUTTON: [&str; 5] =
  ["btn", "btn-primary", "btn-user", "btn-success1", "m-1"];

#[derive(Deserialize)]
struct ContentToken {
  /// base64 of the session page url
  o: String,
}

/// Turns a content reference into playable candidate links by walking the
/// content page → session → drive → delivery host chain.
pub struct Resolver {
  client: reqwest::Client,
  config: ResolverConfig,
  extractor: Extractor,
}

impl Resolver {
  pub fn new(
    client: reqwest::Client,
    config: ResolverConfig,
    extractor: Extractor,
  ) -> Self {
    Self {
      client,
      config,
      extractor,
    }
  }

  /// Candidates come back in discovery order; index 0 is the preferred one.
  pub async fn resolve(
    &self,
    reference: &str,
    signal: &CancellationToken,
  ) -> Result<Vec<CandidateLink>, ResolutionError> {
    let link = self.absolute(reference)?;

    if self.is_delivery_host(&link) {
      debug!(%link, "already a delivery host link");
      return self.extractor.extract(&link, signal).await;
    }

    if is_media_url(&link, &self.config.media_extensions) {
      debug!(%link, "already a direct media link");
      return Ok(vec![CandidateLink::new("Direct", link)]);
    }

    let drive = if link.contains("hubdrive") {
      self.drive_button(&link, signal).await?
    } else {
      self.via_session(&link, signal).await?
    };

    let landing = self.fetch(&drive, Stage::Landing, signal).await?;
    let delivery = META_REFRESH
      .captures(&landing)
      .map(|c| c[1].to_string())
      .unwrap_or(drive);

    info!(%delivery, "resolved delivery host");
    self.extractor.extract(&delivery, signal).await
  }

  async fn via_session(
    &self,
    link: &str,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let page = self.fetch(link, Stage::ContentPage, signal).await?;
    let token = embedded_token(&page)
      .ok_or(ResolutionError::NoTokenFound(Stage::ContentPage))?;
    let payload: ContentToken = decoder::decode(token)?;
    let target = decoder::base64_text(&payload.o, "target url")?;

    let blog = self.establish_session(&target, signal).await?;
    let drive = delivery_link(&blog)
      .ok_or(ResolutionError::NoLinkFound(Stage::SessionBlog))?;

    if drive.contains("hubdrive") {
      self.drive_button(&drive, signal).await
    } else {
      Ok(drive)
    }
  }

  async fn drive_button(
    &self,
    link: &str,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    let page = self.fetch(link, Stage::Drive, signal).await?;
    let dom = tl::parse(&page, tl::ParserOptions::default())
      .map_err(|_| ResolutionError::NoLinkFound(Stage::Drive))?;

    let button = W(&dom)
      .elements(&["a"])
      .into_iter()
      .find(|el| el.has_classes(&DRIVE_BUTTON))
      .and_then(|el| el.href);

    Ok(button.unwrap_or_else(|| link.to_string()))
  }

  fn absolute(&self, reference: &str) -> Result<String, ResolutionError> {
    let reference = reference.trim();
    let link = if reference.starts_with('/') {
      format!("{}{}", self.config.site_base_url, reference)
    } else {
      reference.to_string()
    };

    match Url::parse(&link) {
      Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(link),
      _ => Err(ResolutionError::InvalidUrl(link)),
    }
  }

  fn is_delivery_host(&self, link: &str) -> bool {
    self
      .config
      .delivery_hosts
      .iter()
      .any(|host| link.contains(host.as_str()))
  }

  async fn fetch(
    &self,
    url: &str,
    stage: Stage,
    signal: &CancellationToken,
  ) -> Result<String, ResolutionError> {
    debug!(url, %stage, "fetching");
    let request = async {
      self
        .client
        .get(url)
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

fn embedded_token(page: &str) -> Option<&str> {
  page
    .split(TOKEN_START)
    .nth(1)?
    .split(TOKEN_END)
    .next()
    .filter(|token| !token.is_empty())
}

// First link under a 1080p heading, else any hubcloud drive link.
fn delivery_link(page: &str) -> Option<String> {
  H3_BLOCK
    .captures_iter(page)
    .filter(|block| block[1].contains("1080p"))
    .find_map(|block| HREF.captures(&block[1]).map(|c| c[1].to_string()))
    .or_else(|| HUBCLOUD_DRIVE.captures(page).map(|c| c[1].to_string()))
}
