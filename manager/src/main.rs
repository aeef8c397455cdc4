// File: manager/src/main.rs
use clap::Parser;
use fleet_supervisor::config::ConfigStore;
use fleet_supervisor::fleet_manager::FleetManager;
use fleet_supervisor::fleet_view::{FleetRegistry, FleetView};
use fleet_supervisor::node_client::{new_cli_mutex, NodeClient};
use fleet_supervisor::node_monitor::NodeMonitor;
use fleet_supervisor::notifier::{LoggingNotifier, Notifier};
use fleet_supervisor::supervisor_client::SupervisorClient;
use std::sync::Arc;
use tracing::info;

/// High-availability supervisor for a fleet of blockchain-node processes.
#[derive(Parser, Debug)]
#[command(name = "fleet-supervisor")]
struct Args {
    /// Path to the main jmanager config file
    #[arg(short = 'j', long = "jmanager-config", default_value = "jmanager_config.json")]
    jmanager_config: String,

    /// Path to the node config template
    #[arg(short = 't', long = "config-template", default_value = "config_template.json")]
    config_template: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("loading configuration from {} (template {})", args.jmanager_config, args.config_template);
    let config_store = Arc::new(ConfigStore::load(&args.jmanager_config, &args.config_template).await?);
    config_store.write_all_node_configs().await?;

    let snapshot = config_store.get().await;
    info!("bootstrapping {} nodes", snapshot.nodes.len());

    let cli_mutex = new_cli_mutex();
    let supervisor = Arc::new(SupervisorClient::new(&snapshot.common.supervisor_rpc_url));
    let registry = Arc::new(FleetRegistry::new());

    let mut monitors: Vec<Arc<NodeMonitor>> = Vec::with_capacity(snapshot.nodes.len());
    for node_config in snapshot.nodes.values() {
        let node_client = NodeClient::new(node_config.cli_tool_path.clone(), node_config.rest_host.clone(), cli_mutex.clone());
        let monitor = Arc::new(NodeMonitor::new(node_config.clone(), snapshot.common.clone(), node_client, cli_mutex.clone(), supervisor.clone()));
        registry.register(node_config.node_name.clone(), monitor.clone());
        monitors.push(monitor);
    }

    for monitor in &monitors {
        let view: Arc<dyn FleetView> = registry.clone();
        monitor.bind_fleet_view(view);
    }

    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    let fleet_manager = Arc::new(FleetManager::new(registry.clone(), config_store.clone(), notifier));

    let mut tasks = Vec::with_capacity(monitors.len() + 1);
    for monitor in monitors {
        let store = config_store.clone();
        tasks.push(tokio::spawn(async move { monitor.run(store).await }));
    }
    tasks.push(tokio::spawn({
        let fleet_manager = fleet_manager.clone();
        async move { fleet_manager.run().await }
    }));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting");
        }
        _ = futures::future::join_all(tasks) => {
            info!("all tasks exited unexpectedly");
        }
    }

    Ok(())
}
