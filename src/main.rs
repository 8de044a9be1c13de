use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
  extract::FromRef,
  response::IntoResponse,
  routing::{get, post},
  Router,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod decoder;
mod delivery;
mod error;
mod extractor;
mod orchestrator;
mod resolver;
mod stream;
mod util;

pub use error::{Error, Result};
pub use util::W;

use config::{Config, USER_AGENT};
use delivery::DeliveryProxy;
use extractor::Extractor;
use orchestrator::{CommandLauncher, Orchestrator};
use resolver::Resolver;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, FromRef)]
pub struct AppState {
  pub config: Arc<Config>,
  pub resolver: Arc<Resolver>,
  pub orchestrator: Orchestrator,
  pub delivery: Arc<DeliveryProxy>,
}

impl AppState {
  pub fn new(config: Config) -> anyhow::Result<Self> {
    // upstream sites are browsed like a browser would
    let browser = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .timeout(config.resolver.request_timeout)
      .build()?;
    // local traffic to delivery processes; timeouts are set per request
    let local = reqwest::Client::builder().build()?;

    let extractor = Extractor::new(
      browser.clone(),
      config.extractor.clone(),
      config.resolver.media_extensions.clone(),
    );
    let resolver = Resolver::new(browser, config.resolver.clone(), extractor);

    let launcher = CommandLauncher::new(
      config.orchestrator.program.clone(),
      config.orchestrator.args.clone(),
    );
    let orchestrator = Orchestrator::new(
      Arc::new(launcher),
      config.orchestrator.clone(),
      local.clone(),
    );
    let delivery = DeliveryProxy::new(local, config.delivery.clone());

    Ok(Self {
      config: Arc::new(config),
      resolver: Arc::new(resolver),
      orchestrator,
      delivery: Arc::new(delivery),
    })
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/stream", post(stream::start_stream))
    .route("/stop-stream", post(stream::stop_stream))
    .route("/hls/*path", get(delivery::get_hls))
    .with_state(state)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env().context("invalid configuration")?;
  let state = AppState::new(config)?;

  Toplevel::new(move |s| async move {
    s.start(SubsystemBuilder::new("http", move |subsys| {
      serve(state, subsys)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
  .await?;

  Ok(())
}

async fn serve(state: AppState, subsys: SubsystemHandle) -> anyhow::Result<()> {
  let addr = state.config.listen_addr;
  let orchestrator = state.orchestrator.clone();

  info!(%addr, "listening");
  let res = axum::Server::try_bind(&addr)?
    .serve(router(state).into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await;

  info!("http server stopped, stopping delivery processes");
  orchestrator.shutdown_all();
  res.context("http server failed")
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}
