//! netscout CLI
//!
//! Ranks local addresses and reports the NAT in front of them.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use netscout_discovery::{AddressPool, NetworkAddressManager, SystemInterfaces};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::DiagnosticsProgress;

/// netscout - local address ranking and NAT classification
#[derive(Parser)]
#[command(name = "netscout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// STUN server (host:port), overrides the configuration file
    #[arg(long)]
    stun_server: Option<String>,

    /// Skip STUN and rank addresses by kind only
    #[arg(long)]
    no_stun: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose every local address and print the ranking
    Probe,

    /// Print the best local address
    Best,

    /// Print the public address peers should use for a local port
    Public {
        /// Local port
        #[arg(short, long)]
        port: u16,
    },

    /// Print the NAT classification and public address
    Report,

    /// Write a default configuration file
    InitConfig {
        /// Output path (defaults to the standard config location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(server) = &cli.stun_server {
        config.discovery.stun_server = Some(server.clone());
    }
    if cli.no_stun {
        config.discovery.stun_enabled = false;
    }

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Probe => probe(&config).await?,
        Commands::Best => {
            let manager = discover(&config, false).await?;
            println!("{}", manager.best_local_address());
        }
        Commands::Public { port } => {
            let manager = discover(&config, false).await?;
            println!("{}", manager.public_address_for(port).await?);
        }
        Commands::Report => {
            let manager = discover(&config, false).await?;
            println!("{}", manager.discovery_report());
        }
        Commands::InitConfig { output, force } => init_config(output, force)?,
    }

    Ok(())
}

/// Build a pool over the host's interfaces and wait for every diagnosis
///
/// Ctrl-C cancels the remaining diagnostics; entries keep whatever
/// preference they reached.
async fn discover(config: &Config, show_progress: bool) -> anyhow::Result<NetworkAddressManager> {
    let mut pool = AddressPool::new(config.discovery.clone(), Arc::new(SystemInterfaces));
    let entries = pool.init_pool().await?;
    tracing::debug!("Diagnosing {} address(es)", entries);

    let progress = (show_progress && entries > 0).then(|| DiagnosticsProgress::new(entries));
    // Scoped so the borrow of `pool` ends before it moves into the manager
    {
        let diagnose = async {
            if let Some(progress) = &progress {
                progress.track(&pool).await;
                progress.finish(entries);
            }
            pool.wait_for_diagnostics().await;
        };
        tokio::pin!(diagnose);

        tokio::select! {
            () = &mut diagnose => {}
            result = tokio::signal::ctrl_c() => {
                result?;
                pool.shutdown();
                eprintln!("\nInterrupted, keeping partial results");
                // Cancelled kits still record their preference before exiting
                diagnose.await;
            }
        }
    }

    Ok(NetworkAddressManager::from_pool(pool))
}

/// Diagnose every address and print the ranked pool
async fn probe(config: &Config) -> anyhow::Result<()> {
    match config.discovery.stun_server.as_deref() {
        Some(server) if config.discovery.stun_active() => println!("STUN server: {server}"),
        _ => println!("STUN: disabled"),
    }
    println!();

    let manager = discover(config, true).await?;
    let pool = manager.pool();

    if pool.is_empty() {
        println!("No usable local addresses found");
        return Ok(());
    }

    println!(
        "{:<12} {:<40} {:>5}  {:<22} {}",
        "INTERFACE", "ADDRESS", "PREF", "FIREWALL", "STATE"
    );
    for entry in pool.entries() {
        let preference = entry
            .preference()
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let firewall = entry
            .firewall_descriptor()
            .map_or_else(|| "-".to_string(), |d| d.firewall_type().to_string());
        let state = pool
            .state_of(entry.key())
            .await
            .map_or_else(|| "-".to_string(), |s| s.to_string());

        println!(
            "{:<12} {:<40} {:>5}  {:<22} {}",
            entry.interface(),
            entry.address(),
            preference,
            firewall,
            state
        );
    }

    println!();
    println!("Best local address: {}", manager.best_local_address());
    println!("NAT: {}", manager.discovery_report());

    Ok(())
}

/// Write a default configuration file
fn init_config(output: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(Config::default_path);

    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(&path)?;
    println!("Configuration written to: {}", path.display());
    println!("Set discovery.stun_server to enable NAT classification");

    Ok(())
}
