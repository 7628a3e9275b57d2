use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use turtledash_engine::{PollerConfig, SettingsStore};
use turtledash_server::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "turtledash-server",
    version,
    about = "Local dashboard for monitoring and driving ComputerCraft turtles"
)]
struct Cli {
    /// Address the dashboard listens on.
    #[arg(long, env = "TURTLEDASH_LISTEN", default_value = "127.0.0.1:39334")]
    listen: SocketAddr,

    /// Settings database (defaults to ~/.turtledash/turtledash.db).
    #[arg(long, env = "TURTLEDASH_DB")]
    db: Option<PathBuf>,

    /// Turtle API base URL; stored so later runs reuse it.
    #[arg(long, env = "TURTLEDASH_API_BASE_URL")]
    api_base_url: Option<String>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let db_path = cli.db.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".turtledash")
            .join("turtledash.db")
    });
    let settings = SettingsStore::new(db_path);
    if let Some(url) = cli.api_base_url.as_deref() {
        settings
            .set_api_base_url(url)
            .context("store --api-base-url")?;
    }

    let state = AppState::new(settings, PollerConfig::default())?;
    tracing::info!("dashboard at http://{}", cli.listen);
    turtledash_server::serve(cli.listen, state).await
}
