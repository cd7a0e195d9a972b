mod face;

use anyhow::{Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use rpa_agent::{Agent, AgentConfig, ChromeSession, LaunchConfig, OpenAiResponses};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive Chrome with a computer-use model from a local web UI.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// First port to try for the web UI; the next nine are fallbacks.
    #[arg(long, env = "AGENT_PORT", default_value_t = 3000)]
    port: u16,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    headless: bool,

    /// Try a Chrome already listening on port 9222 before launching one.
    #[arg(long)]
    attach: bool,

    /// Where to start when the task names no URL.
    #[arg(long)]
    home_url: Option<String>,

    #[arg(long, env = "AGENT_PROFILE_DIR")]
    profile_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env()?;
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(home) = args.home_url {
        config.home_url = home;
    }
    let client = Arc::new(OpenAiResponses::new(&config)?);

    // Web UI first so the user sees something while Chrome starts.
    let listener = face::bind(args.port).await?;

    let launch = LaunchConfig {
        headless: args.headless,
        attach: args.attach,
        viewport: config.viewport,
        profile_dir: args.profile_dir,
    };
    info!("launching Chrome...");
    let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&launch))
        .await
        .map_err(|e| anyhow!("Browser launch panicked: {e}"))??;

    info!(model = %config.model, "agent ready, waiting for commands");
    let agent = Agent::new(client, Arc::new(session), config);
    face::serve(listener, agent).await
}
