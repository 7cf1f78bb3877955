use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use feed_client::{
    HttpCatalogueLookup, HttpSessionProvider, LookupSettings, SessionState, StreamClient,
    StreamEngine, TlsConnector,
};
use feed_core::{config, now_ms, tls, LogLayout};
use ingestor::{
    ops,
    sink::{FileSink, RetryingSink},
};

const APPEND_RETRIES: usize = 3;

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load()?;
    info!(?cfg, "loaded config");

    let tls_config = tls::build_tls_config(cfg.ca_bundle.as_deref(), &cfg.cert_pins)?;
    let connector = TlsConnector::new(cfg.stream_host.clone(), cfg.stream_port, tls_config);

    let sink = FileSink::open(LogLayout::new(&cfg.log_dir, &cfg.archive_dir)).await?;
    let sink = RetryingSink::new(sink, APPEND_RETRIES);

    let provider = HttpSessionProvider::from_config(cfg)?;
    let http = Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;
    let catalogue = HttpCatalogueLookup::new(
        http,
        cfg.betting_api_url.clone(),
        cfg.credentials.app_key.clone(),
    );

    ops::serve_all();
    let shutdown = Arc::new(AtomicBool::new(false));
    ops::shutdown::install(shutdown.clone());

    let client = StreamClient::new(
        StreamEngine::new(cfg, String::new(), now_ms()),
        Arc::new(connector),
        Arc::new(sink),
        Arc::new(provider),
        Arc::new(catalogue),
        LookupSettings {
            fields: cfg.lookup_fields.clone(),
            max_results: cfg.lookup_max_results,
        },
        cfg.monitor_tick(),
        shutdown,
    )
    .with_connect_timeout(cfg.connect_timeout());

    let mut states = client.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            ops::set_ready(state == SessionState::Subscribed);
        }
    });

    let engine = client.run().await?;
    info!(
        tracked = engine.registry().len(),
        lagged = engine.monitor().lagged_messages(),
        "ingestor stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
