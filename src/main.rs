use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use responses_bridge::auth::CredentialProvider;
use responses_bridge::config::Config;
use responses_bridge::models::{self, ModelRegistry};
use responses_bridge::proxy::{self, GatewayState};

#[derive(Parser)]
#[command(name = "responses-bridge", version, about)]
struct Args {
    /// Port to listen on (overrides the configured address's port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Minimum seconds between accepted requests
    #[arg(long, value_name = "SECONDS")]
    rate_limit: Option<u64>,

    /// Wait for the rate limit window instead of answering 429
    #[arg(long)]
    wait: bool,

    /// Ask for confirmation before forwarding each request
    #[arg(long)]
    manual: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "responses_bridge=debug"
    } else {
        "responses_bridge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout is reserved for approval prompts
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(port) = args.port {
        let mut addr: SocketAddr = config
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", config.listen))?;
        addr.set_port(port);
        config.listen = addr.to_string();
    }
    if args.rate_limit.is_some() {
        config.limits.rate_limit_seconds = args.rate_limit;
    }
    if args.wait {
        config.limits.rate_limit_wait = true;
    }
    if args.manual {
        config.limits.manual_approve = true;
    }
    Ok(())
}

async fn build_registry(config: &Config, client: &reqwest::Client) -> ModelRegistry {
    let mut registry = ModelRegistry::new(config.models.clone());

    if let Some(url) = &config.upstream.models_url {
        let credentials = CredentialProvider::from_config(&config.upstream);
        match models::fetch_models(client, url, credentials.configured()).await {
            Ok(fetched) => {
                info!(count = fetched.len(), "fetched upstream models");
                registry.merge(fetched);
            }
            Err(e) => warn!("could not fetch upstream models: {e:#}"),
        }
    }

    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args)?;

    let registry = build_registry(&config, &reqwest::Client::new()).await;
    let state = GatewayState::new(&config, registry)?;

    info!(
        chat_completions = %config.upstream.chat_completions_url,
        responses = %config.upstream.responses_url,
        models = state.registry.len(),
        rate_limit = ?config.limits.rate_limit_seconds,
        manual_approve = config.limits.manual_approve,
        "starting gateway"
    );

    proxy::start_server(Arc::new(state), &config.listen).await
}
