//! l4plane - control plane for a distributed Layer 4 load balancer
//!
//! Usage:
//!     l4plane --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use l4plane::balancer::{Addressing, Balancer, Components, Settings};
use l4plane::config::{BackendKind, Config, ConfigWatcher, DeployMode, load_config};
use l4plane::metrics::{MetricsCollector, MetricsServer};
use l4plane::store::{MemoryStore, Store};
use l4plane::sync::memory::{MemoryFirewall, MemoryInterface, MemoryKernel, MemoryRoutes};
use l4plane::sync::{
    CommandRunner, FirewallSyncer, Gobgp, InterfaceSyncer, IpRoute, Iptables, Ipvsadm,
    KernelSyncer, RouteSyncer, Syncer,
};
use l4plane::util::{ShutdownSignal, init_logging};

/// Control plane for a distributed Layer 4 load balancer.
#[derive(Parser, Debug)]
#[command(name = "l4plane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Node: {} ({:?}, {:?} backend)", config.node.id, config.node.mode, config.node.backend);
        println!("  VIP ranges: {}", config.node.vip_ranges.len());
        for range in &config.node.vip_ranges {
            println!("    - {}", range);
        }
        println!("  Seeded services: {}", config.services.len());
        for seed in &config.services {
            println!(
                "    - {} (port {}, {} destinations, {} checks)",
                seed.service.name,
                seed.service.port,
                seed.destinations.len(),
                seed.checks.len()
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        node = %config.node.id,
        mode = ?config.node.mode,
        backend = ?config.node.backend,
        vip_ranges = config.node.vip_ranges.len(),
        "l4plane starting"
    );

    run(cli.config, config)
}

fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config_path, config).await })
}

/// Pick the synchronizer backends named by the configuration.
async fn build_components(
    config: &Config,
    store: Arc<MemoryStore>,
    metrics: MetricsCollector,
) -> Result<Components> {
    let node = &config.node;
    let (kernel, firewall, addressing): (Arc<dyn Syncer>, Arc<dyn Syncer>, Addressing) =
        match node.backend {
            BackendKind::System => {
                let runner = CommandRunner::new(node.command_timeout);
                let kernel = KernelSyncer::new(Arc::new(Ipvsadm::new(runner.clone())));
                let iptables = Iptables::new(runner.clone(), node.nat_chain.clone());
                let firewall = FirewallSyncer::new(Arc::new(iptables), node.outbound_address)
                    .await
                    .with_context(|| format!("failed to prepare firewall chain '{}'", node.nat_chain))?;
                let addressing = match node.mode {
                    DeployMode::Unicast => Addressing::Unicast(Arc::new(InterfaceSyncer::new(
                        Arc::new(IpRoute::new(runner, node.interface.clone())),
                    ))),
                    DeployMode::Anycast => {
                        Addressing::Anycast(Arc::new(RouteSyncer::new(Arc::new(Gobgp::new(runner)))))
                    }
                };
                (
                    Arc::new(kernel) as Arc<dyn Syncer>,
                    Arc::new(firewall) as Arc<dyn Syncer>,
                    addressing,
                )
            }
            BackendKind::Memory => {
                let kernel = KernelSyncer::new(Arc::new(MemoryKernel::new()));
                let firewall =
                    FirewallSyncer::new(Arc::new(MemoryFirewall::new()), node.outbound_address)
                        .await
                        .context("failed to prepare in-memory firewall")?;
                let addressing = match node.mode {
                    DeployMode::Unicast => Addressing::Unicast(Arc::new(InterfaceSyncer::new(
                        Arc::new(MemoryInterface::new()),
                    ))),
                    DeployMode::Anycast => Addressing::Anycast(Arc::new(RouteSyncer::new(
                        Arc::new(MemoryRoutes::new()),
                    ))),
                };
                (
                    Arc::new(kernel) as Arc<dyn Syncer>,
                    Arc::new(firewall) as Arc<dyn Syncer>,
                    addressing,
                )
            }
        };

    Ok(Components {
        election: store.election(&node.id),
        store,
        kernel,
        firewall,
        addressing,
        metrics,
    })
}

async fn run_async(config_path: PathBuf, config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();
    let store = Arc::new(MemoryStore::new());

    let components = build_components(&config, store, metrics.clone()).await?;
    let balancer = Balancer::start(Settings::from_config(&config), components)
        .await
        .context("failed to start balancer")?;

    let mut handles = Vec::new();

    if config.global.metrics.enabled {
        let server = MetricsServer::new(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics,
        );
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            server.run(shutdown_rx).await;
        }));
    }

    balancer.apply_seed(&config.services).await;

    // Hot reload: new ranges first, then the seed list against them.
    let (reload_tx, mut reloads) = mpsc::channel::<Config>(4);
    let watcher = ConfigWatcher::new(config_path, reload_tx);
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        watcher.run(shutdown_rx).await;
    }));
    let reloader = Arc::clone(&balancer);
    handles.push(tokio::spawn(async move {
        while let Some(config) = reloads.recv().await {
            reloader.set_vip_ranges(config.node.vip_ranges.clone());
            reloader.apply_seed(&config.services).await;
        }
    }));

    info!(leader = balancer.is_leader(), "l4plane is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    balancer.shutdown().await;
    shutdown.shutdown();

    // The reload task ends once the watcher drops its sender.
    for handle in handles {
        let _ = handle.await;
    }

    info!("l4plane shut down complete");
    Ok(())
}
