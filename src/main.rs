use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, EnvFilter};

mod backend;
mod config;
mod error;
mod jobs;
mod prompt;
mod server;
mod sessions;
mod sink;
mod template;
mod transcript;

use crate::backend::{CompletionBackend, OllamaBackend};
use crate::config::Config;
use crate::jobs::{JobManager, SqliteJobStore};
use crate::sessions::SessionStore;
use crate::sink::ArtifactSink;

#[derive(Debug, Parser)]
#[command(name = "debrief")]
#[command(about = "Turns coding session transcripts into analysis artifacts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve {
        #[arg(long, default_value = "127.0.0.1:7868")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let config = Config::from_env()?;

            if let Some(metrics_addr) = config.metrics_listen {
                PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()?;
                tracing::info!(%metrics_addr, "metrics exporter listening");
            }

            let store = Arc::new(SqliteJobStore::initialize(&config.database_url).await?);
            let backend: Arc<dyn CompletionBackend> = Arc::new(OllamaBackend::new(
                &config.backend_url,
                Duration::from_secs(config.timeout_secs),
            ));
            let sink = Arc::new(ArtifactSink::new(config.artifacts_dir.clone()));
            let sessions = SessionStore::new(config.sessions_dir.clone());

            let manager = JobManager::start(
                store,
                backend.clone(),
                sink,
                sessions.clone(),
                config.clone(),
            )
            .await?;

            let state = server::AppState {
                manager,
                sessions,
                backend,
                config,
            };
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
