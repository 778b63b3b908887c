use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatbridge::{build_router, spawn_eviction, AppState, ConfigManager};

#[derive(Parser, Debug)]
#[command(name = "chatbridge", about = "Bridges OneBot IM events to an OpenAI-compatible LLM")]
struct Cli {
    /// Directory holding settings.json and conversation history
    #[arg(long, env = "CHATBRIDGE_DATA_DIR", default_value = "app_data")]
    data_dir: String,

    /// Overrides the port from settings.json
    #[arg(long, env = "CHATBRIDGE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; log records from the library go through the tracing-log bridge
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConfigManager::new(&cli.data_dir);
    let mut settings = config
        .load_or_init()
        .with_context(|| format!("failed to initialize settings in {}", cli.data_dir))?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    let port = settings.port;
    let ttl = Duration::from_secs(settings.state_ttl_secs);
    let sweep = Duration::from_secs(settings.eviction_interval_secs);

    log::info!(
        "upstream {} (model {}, sse {}), onebot {}",
        settings.upstream_url,
        settings.model,
        settings.use_sse,
        settings.onebot_http_path
    );

    let state = AppState::with_onebot(settings, &cli.data_dir).context("failed to build app state")?;
    let eviction = spawn_eviction(state.turn_state.clone(), ttl, sweep);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("shutting down");
        })
        .await?;

    eviction.abort();
    Ok(())
}
