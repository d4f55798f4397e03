//! dns-routes binary entry point.

use clap::Parser;
use dns_routes::{daemon, telemetry, Config, Daemon};
use std::path::PathBuf;
use tracing::info;

/// Keep host routes in sync with the resolved addresses of domain groups.
#[derive(Parser, Debug)]
#[command(name = "dns-routes")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML or YAML).
    #[arg(short, long, default_value = "dns-routes.toml")]
    config: PathBuf,

    /// Validate the configuration and exit without touching routes.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("DNS_ROUTES")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        link = %config.target.name,
        gateway = %config.target.gateway,
        sources = config.sources.len(),
        "Starting dns-routes"
    );

    if args.check {
        config.validate()?;
        let groups = daemon::build_groups(&config, daemon::udp_exchange)?;
        info!(groups = groups.len(), "Configuration is valid");
        return Ok(());
    }

    Daemon::from_config(&config)
        .await?
        .run(daemon::shutdown_signal())
        .await;

    info!("dns-routes shutdown complete");
    Ok(())
}
