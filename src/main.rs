use std::sync::{Arc, atomic::Ordering};

use clap::Parser;
use echogate::{
    AppState, Config,
    telemetry::{AnalyticsSink, FanOutSink, HttpAnalyticsSink, TelemetryWorker},
};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "echogate", version, about = "LLM gateway with a semantic response cache")]
struct Args {
    /// Bind address, overriding ECHOGATE_BIND.
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let state = AppState::build(config)?;

    // Telemetry consumer: always the in-memory analytics store, plus the
    // HTTP export when configured.
    let mut sinks: Vec<Arc<dyn AnalyticsSink>> = vec![state.analytics.clone()];
    if let (Some(endpoint), Some(credential)) = (
        state.config.analytics_endpoint.clone(),
        state.config.analytics_credential.clone(),
    ) {
        sinks.push(Arc::new(HttpAnalyticsSink::new(
            reqwest::Client::new(),
            endpoint,
            credential,
        )));
    }
    let worker = TelemetryWorker::new(
        state.telemetry.clone(),
        Arc::new(FanOutSink::new(sinks)),
    );
    let telemetry_shutdown = worker.shutdown_handle();
    let telemetry_handle = tokio::spawn(worker.run());

    // Periodic maintenance: expired-entry sweep and counter pruning.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let _ = state.cache.index().sweep().await;
                let now = chrono::Utc::now();
                state.limiter.prune(now);
                state.quota.prune(now);
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    tracing::info!(addr = %state.config.bind_addr, "echogate listening");

    let app = echogate::routes::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Drain in-flight detached work, then the telemetry queue.
    state.tracker.close();
    state.tracker.wait().await;
    telemetry_shutdown.store(true, Ordering::Release);
    state.telemetry.wake();
    let _ = telemetry_handle.await;

    Ok(())
}
