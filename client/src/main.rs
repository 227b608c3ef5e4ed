use anyhow::{Context, Result};
use clap::Parser;
use porthole::{RawTunnelConfig, TunnelConfig, TunnelSession};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "porthole")]
#[command(author = "Porthole Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a public tunnel URL", long_about = None)]
struct Cli {
    /// Local port to expose
    port: Option<u16>,

    /// Broker authentication token
    #[arg(short, long, env = "PORTHOLE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Broker hostname
    #[arg(short, long)]
    domain: Option<String>,

    /// Requested public subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Connect with ws:// instead of wss://
    #[arg(long)]
    insecure: bool,

    /// Config file (default: porthole.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> RawTunnelConfig {
        RawTunnelConfig {
            token: self.token.clone(),
            secure: self.insecure.then_some(false),
            domain: self.domain.clone(),
            subdomain: self.subdomain.clone(),
            port: self.port.map(i64::from),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "porthole=debug"
    } else {
        "porthole=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let from_file = match cli.config.clone().or_else(RawTunnelConfig::find_config) {
        Some(path) => {
            info!("Using config file {}", path.display());
            RawTunnelConfig::load(&path)?
        }
        None => RawTunnelConfig::default(),
    };

    let config = TunnelConfig::from_raw(&from_file.merge(cli.overrides()))
        .context("Invalid tunnel configuration")?;
    let local_port = config.port();

    let mut active = TunnelSession::new(config)
        .connect()
        .await
        .context("Failed to open tunnel")?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 Porthole Active                                          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", active.url());
    println!("║  Local:      http://localhost:{:<30} ║", local_port);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = active.closed() => false,
    };

    if interrupted {
        info!("Shutting down...");
        active.shutdown().await;
    } else {
        warn!("Tunnel closed by the broker");
    }

    Ok(())
}
