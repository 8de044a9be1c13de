use std::sync::Arc;

use axum::{
  body::{boxed, BoxBody, Full, StreamBody},
  extract::{Path, Query, State},
  http::Response,
};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header;
use serde::Deserialize;
use tracing::debug;

use crate::{
  config::DeliveryConfig,
  error::DeliveryError,
  util::retry_fixed,
  Error, Result,
};

const MANIFEST_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_TYPE: &str = "video/MP2T";
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";
// segment names are never reused by the delivery process
const IMMUTABLE: &str = "public, max-age=31536000, immutable";

static PLAYLIST_REF: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"[A-Za-z0-9_\-.]+\.(?:m3u8|ts)").unwrap());

/// Relays manifests and segments from the delivery process listening on a
/// given local port.
pub struct DeliveryProxy {
  client: reqwest::Client,
  config: DeliveryConfig,
}

#[derive(Deserialize)]
pub struct HlsQuery {
  port: Option<String>,
}

pub async fn get_hls(
  State(proxy): State<Arc<DeliveryProxy>>,
  Path(path): Path<String>,
  Query(query): Query<HlsQuery>,
) -> Result<Response<BoxBody>> {
  let port = parse_port(query.port.as_deref())?;
  let path = path.trim_start_matches('/');
  if path.is_empty() {
    return Err(Error::MissingPath);
  }

  proxy.serve(path, port).await
}

pub fn parse_port(raw: Option<&str>) -> Result<u16> {
  let raw = raw
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .ok_or(Error::MissingPort)?;

  match raw.parse::<u16>() {
    Ok(port) if port >= 1024 => Ok(port),
    _ => Err(Error::InvalidPort),
  }
}

/// Points every playlist or segment reference in `manifest` back at this
/// proxy by tagging it with the routing port. References that already carry
/// a query string are left alone.
pub fn rewrite_manifest(manifest: &str, port: u16) -> String {
  let mut out = String::with_capacity(manifest.len() + 64);
  let mut last = 0;

  for found in PLAYLIST_REF.find_iter(manifest) {
    out.push_str(&manifest[last..found.end()]);
    if !manifest[found.end()..].starts_with('?') {
      out.push_str("?port=");
      out.push_str(&port.to_string());
    }
    last = found.end();
  }

  out.push_str(&manifest[last..]);
  out
}

impl DeliveryProxy {
  pub fn new(client: reqwest::Client, config: DeliveryConfig) -> Self {
    Self { client, config }
  }

  pub async fn serve(
    &self,
    path: &str,
    port: u16,
  ) -> Result<Response<BoxBody>> {
    let url = format!(
      "http://{}:{}/hls/{}",
      self.config.upstream_host, port, path
    );
    debug!(port, path, "proxying hls request");

    if path.ends_with(".m3u8") {
      self.manifest(&url, port).await
    } else {
      self.segment(&url, path).await
    }
  }

  async fn manifest(&self, url: &str, port: u16) -> Result<Response<BoxBody>> {
    let text = async {
      self
        .client
        .get(url)
        .timeout(self.config.manifest_timeout)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
    }
    .await
    .map_err(DeliveryError::from)?;

    let resp = Response::builder()
      .status(200)
      .header(header::CONTENT_TYPE, MANIFEST_TYPE)
      .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
      .header(header::CACHE_CONTROL, NO_CACHE)
      .body(boxed(Full::from(rewrite_manifest(&text, port))))?;

    Ok(resp)
  }

  async fn segment(&self, url: &str, path: &str) -> Result<Response<BoxBody>> {
    let what = format!("segment {path}");
    let upstream = retry_fixed(
      self.config.segment_attempts,
      self.config.segment_backoff,
      &what,
      move |_| async move {
        self
          .client
          .get(url)
          .timeout(self.config.segment_timeout)
          .send()
          .await?
          .error_for_status()
      },
    )
    .await
    .map_err(DeliveryError::from)?;

    let mut resp = Response::builder()
      .status(200)
      .header(header::CONTENT_TYPE, SEGMENT_TYPE)
      .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
      .header(header::CACHE_CONTROL, IMMUTABLE);
    if let Some(len) = upstream.content_length() {
      resp = resp.header(header::CONTENT_LENGTH, len);
    }

    let body = StreamBody::new(upstream.bytes_stream());
    Ok(resp.body(boxed(body))?)
  }
}
