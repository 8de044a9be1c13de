use once_cell::sync::Lazy;
use regex::Regex;

use super::CandidateLink;
use crate::W;

static SCRIPT_BLOCK: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?is)<script[^>]*>(.*?)</script>").unwrap());

static FILE_KEY: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"file:\s*["']([^"']+)["']"#).unwrap());

static SOURCES_ARRAY: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"sources:\s*\[([^\]]+)\]").unwrap());

static QUOTED: Lazy<Regex> =
  Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());

static LINK_QUALITY: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?i)(\d+p|HD|SD|4K)").unwrap());

static BUTTON_QUALITY: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?i)(\d+p|HD|SD|4K|10Gbps|FSL)").unwrap());

/// A download/server button whose target may need further hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
  pub quality: String,
  pub href: String,
}

#[derive(Debug, Default)]
pub struct PageScan {
  /// Links found directly on the page, strongest strategy first.
  pub media: Vec<CandidateLink>,
  pub buttons: Vec<Button>,
}

pub fn scan_page(html: &str, extensions: &[String]) -> PageScan {
  let Ok(dom) = tl::parse(html, tl::ParserOptions::default()) else {
    return PageScan::default();
  };
  let dom = W(&dom);
  let mut media = Vec::new();

  // native media elements
  for el in dom.elements(&["source", "video"]) {
    let Some(src) = el.src else { continue };
    let media_type = el.media_type.unwrap_or_else(|| "video/mp4".into());
    media.push(CandidateLink {
      quality: "auto".into(),
      url: src,
      media_type: Some(media_type),
    });
  }

  // anchors pointing straight at a media file
  let anchors = dom.elements(&["a"]);
  for el in &anchors {
    let Some(href) = el.http_href() else { continue };
    if is_media_url(href, extensions) {
      media.push(CandidateLink::new(quality_of(&LINK_QUALITY, &el.text), href));
    }
  }

  // player setup hidden in inline scripts
  for script in SCRIPT_BLOCK.captures_iter(html) {
    let body = &script[1];
    for cap in FILE_KEY.captures_iter(body) {
      if is_media_url(&cap[1], extensions) {
        media.push(CandidateLink::new("auto", &cap[1]));
      }
    }
    for sources in SOURCES_ARRAY.captures_iter(body) {
      for cap in QUOTED.captures_iter(&sources[1]) {
        if is_media_url(&cap[1], extensions) {
          media.push(CandidateLink::new("auto", &cap[1]));
        }
      }
    }
  }

  let buttons = dom
    .elements(&["a", "button"])
    .into_iter()
    .filter(|el| el.text.contains("Download") || el.text.contains("Server"))
    .filter_map(|el| {
      let href = el.href.as_deref().filter(|href| href.contains("http"))?;
      Some(Button {
        quality: quality_of(&BUTTON_QUALITY, &el.text),
        href: href.to_string(),
      })
    })
    .collect();

  PageScan { media, buttons }
}

/// Whether the url's path ends in one of the given media extensions.
pub fn is_media_url(url: &str, extensions: &[String]) -> bool {
  let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
  extensions.iter().any(|ext| path.ends_with(ext.as_str()))
}

fn quality_of(pattern: &Regex, text: &str) -> String {
  pattern
    .find(text)
    .map(|m| m.as_str().to_string())
    .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::ResolverConfig;

  fn exts() -> Vec<String> {
    ResolverConfig::default().media_extensions
  }

  #[test]
  fn test_is_media_url() {
    let exts = exts();
    assert!(is_media_url("https://a.example/x.MKV", &exts));
    assert!(is_media_url("https://a.example/x.m3u8?token=1", &exts));
    assert!(!is_media_url("https://a.example/x.mp4.html", &exts));
    assert!(!is_media_url("https://a.example/watch?f=x.mp4", &exts));
  }

  #[test]
  fn test_script_sources_array() {
    let html = r#"<script>
      var cfg = { sources: [
        "https://a.example/1.mp4", 'https://a.example/2.m3u8', "poster.jpg"
      ] };
    </script>"#;
    let scan = scan_page(html, &exts());
    let urls: Vec<_> = scan.media.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(
      urls,
      vec!["https://a.example/1.mp4", "https://a.example/2.m3u8"]
    );
  }

  #[test]
  fn test_buttons() {
    let html = r#"
      <a href="https://hop.example/a">Download [10Gbps]</a>
      <button>Download</button>
      <a href="/relative">Server 1</a>
      <a href="https://other.example/b">Watch</a>
    "#;
    let scan = scan_page(html, &exts());
    assert!(scan.media.is_empty());
    assert_eq!(
      scan.buttons,
      vec![Button {
        quality: "10Gbps".into(),
        href: "https://hop.example/a".into(),
      }]
    );
  }

  #[test]
  fn test_quality_labels() {
    assert_eq!(quality_of(&LINK_QUALITY, "Episode 1080p x264"), "1080p");
    assert_eq!(quality_of(&LINK_QUALITY, "Mirror"), "unknown");
    assert_eq!(quality_of(&BUTTON_QUALITY, "Download [FSL Server]"), "FSL");
  }
}
