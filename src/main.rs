#[cfg(not(target_os = "linux"))]
compile_error!("portname needs Linux (sock_diag, procfs, network namespaces)");

mod address;
mod backends;
mod config;
mod naming;
mod orchestrator;
mod proxy;
mod service;
mod sock_diag;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::watch;

use crate::backends::{HttpDynDns, IpCommandConfigurator, KernelDiscovery};
use crate::config::Config;
use crate::orchestrator::{PlannedService, ProxyOrchestrator};

/// portname - expose every local TCP service under its own name and address
#[derive(Parser, Debug)]
#[command(name = "portname")]
#[command(version)]
#[command(about = "Give listening TCP services a name, an IPv6 address and a reverse proxy", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/portname/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the services that would be exposed and exit
    #[arg(long)]
    list: bool,

    /// Discover sockets inside this network namespace (e.g. /run/netns/NAME)
    #[arg(long, value_name = "PATH")]
    netns: Option<PathBuf>,

    /// Rescan for new services every SECONDS (default: only at startup)
    #[arg(long, value_name = "SECONDS")]
    rescan: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn print_plan(planned: &[PlannedService]) {
    if planned.is_empty() {
        println!("No services to expose");
        return;
    }

    println!("{:<28} {:<24} ADDRESS", "LISTENING", "NAME");
    for service in planned {
        println!(
            "{:<28} {:<24} {}",
            service.socket.to_string(),
            service.record.name,
            service.record.proxy_address
        );
    }
}

/// Flip `shutdown` on Ctrl+C or SIGTERM
async fn wait_for_shutdown(shutdown: watch::Sender<bool>) {
    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                log::warn!("Cannot listen for Ctrl+C: {}", e);
                // Keep the sender alive, proxies treat a dropped sender as shutdown
                std::future::pending::<()>().await;
            }
            let _ = shutdown.send(true);
            return;
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Cannot listen for Ctrl+C: {}", e);
                sigterm.recv().await;
            }
        }
        _ = sigterm.recv() => {}
    }
    log::info!("Shutting down");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(secs) = args.rescan {
        config.rescan_interval_secs = Some(secs);
    }
    config.validate()?;

    if args.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let dyndns = HttpDynDns::new(&config.dyndns_endpoint, config.dyndns_timeout())?;
    let discovery = KernelDiscovery::new(args.netns, config.proc_root.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut orchestrator = ProxyOrchestrator::new(
        config,
        Arc::new(discovery),
        Arc::new(IpCommandConfigurator::default()),
        dyndns,
        shutdown_rx,
    );

    if args.list {
        print_plan(&orchestrator.plan().await?);
        return Ok(());
    }

    if !IpCommandConfigurator::check_available() {
        log::warn!("ip (iproute2) not found, configuring addresses will fail");
    }

    tokio::spawn(wait_for_shutdown(shutdown_tx));

    log::info!("Exposing listening services");
    orchestrator.run().await
}
