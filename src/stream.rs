use axum::{
  extract::{rejection::JsonRejection, State},
  Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{AppState, Error, Result};

#[derive(Deserialize)]
pub struct StartStreamReq {
  link: Option<String>,
  #[serde(rename = "type", default = "default_kind")]
  kind: String,
}

fn default_kind() -> String {
  "movie".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamResp {
  stream_url: String,
  proxy_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  duration: Option<f64>,
}

pub async fn start_stream(
  State(state): State<AppState>,
  req: std::result::Result<Json<StartStreamReq>, JsonRejection>,
) -> Result<Json<StartStreamResp>> {
  // an unreadable body carries no link either
  let Json(req) = req.map_err(|rejection| {
    debug!("unreadable stream request: {}", rejection);
    Error::MissingLink
  })?;
  let link = req
    .link
    .filter(|link| !link.trim().is_empty())
    .ok_or(Error::MissingLink)?;
  info!(%link, kind = %req.kind, "stream requested");

  // resolution stops when the client goes away and this future is dropped
  let signal = CancellationToken::new();
  let _guard = signal.clone().drop_guard();

  let streams = state.resolver.resolve(&link, &signal).await?;
  let stream = streams.into_iter().next().ok_or(Error::NoStreams)?;
  let bound = state.orchestrator.acquire(&stream.url).await?;

  Ok(Json(StartStreamResp {
    proxy_url: format!(
      "/hls/{}?port={}",
      state.config.delivery.manifest_name, bound.port
    ),
    stream_url: stream.url,
    duration: bound.duration,
  }))
}

// Always succeeds; stopping is best effort.
pub async fn stop_stream(
  State(state): State<AppState>,
  body: Option<Json<Value>>,
) -> Json<Value> {
  match body.as_ref().and_then(|Json(body)| port_of(body)) {
    Some(port) => {
      let outcome = state.orchestrator.release(port).await;
      info!(port, ?outcome, "stream stopped");
    }
    None => info!("stop requested without a usable port"),
  }

  Json(json!({ "message": "Stop sequence processed" }))
}

// Accepts the port as a number or a numeric string.
fn port_of(body: &Value) -> Option<u16> {
  match body.get("port")? {
    Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

#[cfg(test)]
mod test {
  use axum::{
    body::Body,
    http::{header, Request, StatusCode},
  };
  use tower::ServiceExt;

  use super::*;
  use crate::{config::Config, router};

  async fn post(
    state: AppState,
    uri: &str,
    body: Value,
  ) -> (StatusCode, Value) {
    send(state, uri, "application/json", body.to_string()).await
  }

  async fn send(
    state: AppState,
    uri: &str,
    content_type: &str,
    body: String,
  ) -> (StatusCode, Value) {
    let req = Request::post(uri)
      .header(header::CONTENT_TYPE, content_type)
      .body(Body::from(body))
      .unwrap();
    let resp = router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
  }

  #[test]
  fn test_port_of() {
    assert_eq!(port_of(&json!({"port": 8001})), Some(8001));
    assert_eq!(port_of(&json!({"port": " 8001 "})), Some(8001));
    assert_eq!(port_of(&json!({"port": 99999})), None);
    assert_eq!(port_of(&json!({"port": null})), None);
    assert_eq!(port_of(&json!({})), None);
  }

  #[tokio::test]
  async fn test_unreadable_body() {
    let state = AppState::new(Config::default()).unwrap();
    let expected = json!({ "error": "Link is required" });

    let (status, body) =
      send(state.clone(), "/stream", "text/plain", "garbage".into()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, expected);

    let (status, body) =
      send(state.clone(), "/stream", "application/json", "{link:".into())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, expected);

    let (status, body) =
      post(state, "/stream", json!({ "link": 42 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, expected);
  }

  #[tokio::test]
  async fn test_missing_link() {
    let state = AppState::new(Config::default()).unwrap();
    let (status, body) =
      post(state, "/stream", json!({ "type": "movie" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "Link is required" }));
  }

  #[tokio::test]
  async fn test_stop_always_succeeds() {
    let state = AppState::new(Config::default()).unwrap();
    for body in [json!({}), json!({ "port": "abc" }), json!({ "port": 1 })] {
      let (status, body) = post(state.clone(), "/stop-stream", body).await;
      assert_eq!(status, StatusCode::OK);
      assert_eq!(body, json!({ "message": "Stop sequence processed" }));
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_start_and_stop_stream() {
    let mut config = Config::default();
    // stands in for the delivery program: announce readiness, then idle
    config.orchestrator.program = "sh".into();
    config.orchestrator.args = vec![
      "-c".into(),
      r#"echo '{"event":"bound","port":8765,"duration":12.5}'; sleep 30"#
        .into(),
      "delivery".into(),
    ];
    let state = AppState::new(config).unwrap();
    let link = "https://cdn.example/movie.mkv";

    let (status, body) =
      post(state.clone(), "/stream", json!({ "link": link })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
      body,
      json!({
        "streamUrl": link,
        "proxyUrl": "/hls/stream.m3u8?port=8765",
        "duration": 12.5,
      })
    );

    // second viewer joins the same process
    let (_, again) =
      post(state.clone(), "/stream", json!({ "link": link })).await;
    assert_eq!(again["proxyUrl"], "/hls/stream.m3u8?port=8765");

    let (status, _) =
      post(state.clone(), "/stop-stream", json!({ "port": "8765" })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) =
      post(state.clone(), "/stop-stream", json!({ "port": 8765 })).await;
    assert_eq!(status, StatusCode::OK);
    state.orchestrator.shutdown_all();
  }
}
