//! resilience-server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) layered with
//! `RESILIENCE_*` environment variables, opens the SQLite profile store,
//! starts the session monitor, and serves HTTP.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use resilience_core::{monitor::SessionMonitor, reconcile::Reconciler};
use resilience_gotrue::GoTrueProvider;
use resilience_server::{AppState, ServerConfig};
use resilience_store_sqlite::SqliteProfileStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "ResiliencePro profile server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("RESILIENCE"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let store_path = expand_tilde(&server_cfg.store_path);
  let store = SqliteProfileStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let store = Arc::new(store);

  let provider = GoTrueProvider::new(server_cfg.gotrue_config())
    .context("failed to build auth client")?;
  let provider = Arc::new(provider);

  // Reconciliation is driven by the provider's session events.
  let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), server_cfg.reconciler_config()));
  let monitor = SessionMonitor::spawn(provider.as_ref(), reconciler);

  let address = format!("{}:{}", server_cfg.host, server_cfg.port);
  let app = resilience_server::router(AppState::new(store, provider, server_cfg));

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
      }
    })
    .await
    .context("server error")?;

  monitor.shutdown().await;
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
