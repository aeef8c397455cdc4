// File: manager/src/fleet_view.rs
//! The "do any other monitors exist in STARTED" query is a capability,
//! not a back-reference graph (§9 design note): each NodeMonitor holds an
//! `Arc<dyn FleetView>` rather than a list of its siblings.

use crate::node_monitor::{NodeMonitor, NodeState};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait FleetView: Send + Sync {
    fn any_other_started(&self, exclude: &str) -> bool;
    fn node_names(&self) -> Vec<String>;
}

/// Owns the concrete list of monitors; the FleetManager populates it once
/// at startup, before any monitor task is spawned.
#[derive(Default)]
pub struct FleetRegistry {
    monitors: RwLock<HashMap<String, Arc<NodeMonitor>>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_name: String, monitor: Arc<NodeMonitor>) {
        self.monitors.write().unwrap().insert(node_name, monitor);
    }

    pub fn get(&self, node_name: &str) -> Option<Arc<NodeMonitor>> {
        self.monitors.read().unwrap().get(node_name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<NodeMonitor>> {
        self.monitors.read().unwrap().values().cloned().collect()
    }
}

impl FleetView for FleetRegistry {
    fn any_other_started(&self, exclude: &str) -> bool {
        self.monitors
            .read()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .any(|(_, monitor)| monitor.state() == NodeState::Started)
    }

    fn node_names(&self) -> Vec<String> {
        self.monitors.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonConfig, NodeConfig};
    use crate::node_client::{new_cli_mutex, NodeClient};
    use crate::supervisor_client::SupervisorClient;

    fn dummy_monitor(name: &str) -> Arc<NodeMonitor> {
        let config = NodeConfig {
            node_name: name.to_string(),
            config_file_path: "/tmp/dummy.json".to_string(),
            rest_scheme: "http".to_string(),
            rest_host: "127.0.0.1".to_string(),
            rest_port: 8080,
            rest_base: "/api".to_string(),
            cli_tool_path: "/bin/true".to_string(),
            supervisor_service_name: name.to_string(),
            default_trusted_peers: serde_json::json!([]),
            secret_file_path: "/tmp/secret".to_string(),
            merged_config: serde_json::json!({"p2p": {"trusted_peers": []}}),
        };
        let common = CommonConfig {
            refresh_interval_sec: 1,
            tip_timeout_sec: 30,
            tip_diff_threshold: 3,
            leaders_refresh_interval_sec: 10,
            restarts_log_path: "/tmp/restarts.log".to_string(),
            supervisor_rpc_url: "http://127.0.0.1:9001/RPC2".to_string(),
        };
        let cli_mutex = new_cli_mutex();
        let node_client = NodeClient::new(config.cli_tool_path.clone(), config.rest_host.clone(), cli_mutex.clone());
        let supervisor = Arc::new(SupervisorClient::new("http://127.0.0.1:9001/RPC2"));
        Arc::new(NodeMonitor::new(config, common, node_client, cli_mutex, supervisor))
    }

    #[test]
    fn any_other_started_excludes_self_and_respects_state() {
        let registry = FleetRegistry::new();
        let a = dummy_monitor("a");
        let b = dummy_monitor("b");
        registry.register("a".to_string(), a.clone());
        registry.register("b".to_string(), b.clone());

        assert!(!registry.any_other_started("a"));

        b.set_state(NodeState::Started);
        assert!(registry.any_other_started("a"));
        assert!(!registry.any_other_started("b"));
    }
}
