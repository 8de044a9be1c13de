use crate::W;

/// An owned snapshot of one tag, detached from the parsed document so it can
/// cross await points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
  pub name: String,
  pub href: Option<String>,
  pub src: Option<String>,
  pub media_type: Option<String>,
  pub class: Option<String>,
  pub text: String,
}

impl Element {
  pub fn has_classes(&self, wanted: &[&str]) -> bool {
    let Some(class) = &self.class else {
      return false;
    };
    let classes: Vec<_> = class.split_whitespace().collect();
    wanted.iter().all(|w| classes.contains(w))
  }

  pub fn http_href(&self) -> Option<&str> {
    self.href.as_deref().filter(|href| href.starts_with("http"))
  }
}

impl W<&tl::VDom<'_>> {
  /// All tags with one of the given names, in document order.
  pub fn elements(&self, names: &[&str]) -> Vec<Element> {
    let parser = self.0.parser();

    self
      .0
      .nodes()
      .iter()
      .filter_map(|node| node.as_tag())
      .filter_map(|tag| {
        let name = tag.name().as_utf8_str();
        names
          .iter()
          .any(|n| name.eq_ignore_ascii_case(n))
          .then(|| Element {
            name: name.to_ascii_lowercase(),
            href: attr(tag, "href"),
            src: attr(tag, "src"),
            media_type: attr(tag, "type"),
            class: attr(tag, "class"),
            text: tag.inner_text(parser).trim().to_string(),
          })
      })
      .collect()
  }
}

fn attr(tag: &tl::HTMLTag<'_>, name: &'static str) -> Option<String> {
  tag
    .attributes()
    .get(name)
    .flatten()
    .map(|value| value.as_utf8_str().trim().replace("&amp;", "&"))
    .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod test {
  use crate::W;

  #[test]
  fn test_elements() {
    let html = r#"
      <div><a class="btn btn-primary m-1"
        href="https://a.example/x?a=1&amp;b=2">
        <span>Drive</span> Link</a></div>
      <video><source src="https://cdn.example/v.mp4" type="video/mp4"></video>
      <a>no href</a>
    "#;
    let dom = tl::parse(html, tl::ParserOptions::default()).unwrap();

    let anchors = W(&dom).elements(&["a"]);
    assert_eq!(anchors.len(), 2);
    assert_eq!(
      anchors[0].href.as_deref(),
      Some("https://a.example/x?a=1&b=2")
    );
    assert!(anchors[0].text.contains("Drive"));
    assert!(anchors[0].has_classes(&["btn", "m-1"]));
    assert!(!anchors[0].has_classes(&["btn-user"]));
    assert_eq!(anchors[1].href, None);

    let sources = W(&dom).elements(&["source", "video"]);
    let source = sources.iter().find(|e| e.name == "source").unwrap();
    assert_eq!(source.src.as_deref(), Some("https://cdn.example/v.mp4"));
    assert_eq!(source.media_type.as_deref(), Some("video/mp4"));
  }
}
