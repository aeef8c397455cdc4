// File: manager/src/config/mod.rs
pub mod store;

pub use store::ConfigStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-node, immutable-per-config-version settings. §3 NodeConfig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,
    pub config_file_path: String,
    pub rest_scheme: String,
    pub rest_host: String,
    pub rest_port: u16,
    pub rest_base: String,
    pub cli_tool_path: String,
    pub supervisor_service_name: String,
    pub default_trusted_peers: serde_json::Value,
    pub secret_file_path: String,
    /// Merged node-config body (JSON-shaped tree), after template overlay.
    pub merged_config: serde_json::Value,
}

impl NodeConfig {
    pub fn rest_host_port(&self) -> String {
        format!("{}://{}:{}{}", self.rest_scheme, self.rest_host, self.rest_port, self.rest_base)
    }
}

/// Shared timeouts/paths. §3 CommonConfig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    pub refresh_interval_sec: u64,
    pub tip_timeout_sec: i64,
    pub tip_diff_threshold: i64,
    pub leaders_refresh_interval_sec: i64,
    pub restarts_log_path: String,
    pub supervisor_rpc_url: String,
}

/// Fleet-level policy knobs. §3 ManagerConfig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub timeout_between_restarts_sec: i64,
    pub min_scheduled_time_difference_sec: i64,
    pub send_slots_within_sec: i64,
    pub epoch_start_time: EpochStartTime,
    pub pool_id: String,
    pub genesis_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStartTime {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Email notification config — interface boundary only (§1 out of scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub email_alerts: bool,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default)]
    pub templates: HashMap<String, EmailTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub message: String,
}

/// Pool-tool (aggregator) endpoints and slot-verification mode. §3/§4.7/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolToolConfig {
    pub user_id: String,
    pub status_summary: EndpointConfig,
    pub send_tip: EndpointConfig,
    pub send_slots: SendSlotsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub refresh_rate: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSlotsConfig {
    pub url: String,
    pub key_path: String,
    #[serde(default)]
    pub verify_slots_gpg: bool,
    #[serde(default)]
    pub verify_slots_hash: bool,
}

/// Top-level merged configuration snapshot, as produced by ConfigStore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub nodes: HashMap<String, NodeConfig>,
    pub common: CommonConfig,
    pub manager: ManagerConfig,
    pub email: EmailConfig,
    pub pool_tool: PoolToolConfig,
}

impl ConfigSnapshot {
    pub fn node(&self, node_name: &str) -> Option<&NodeConfig> {
        self.nodes.get(node_name)
    }
}

/// Shape of the on-disk main jmanager config file (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfigFile {
    pub nodes_config: Vec<NodeConfigEntry>,
    pub common_config: CommonConfigFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigEntry {
    pub node_name: String,
    pub jmanager_settings: JManagerSettings,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JManagerSettings {
    pub node_path: String,
    pub supervisor_service_name: String,
    pub default_trusted_peers: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfigFile {
    pub jormungandr: JormungandrCommonFile,
    pub manager: ManagerConfigFile,
    pub email: EmailConfig,
    pub pooltool: PoolToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JormungandrCommonFile {
    pub timeouts: TimeoutsFile,
    pub tip_diff_threshold: i64,
    pub common_dir: String,
    pub restarts_log_filename: String,
    pub secret: String,
    pub supervisor_rest_api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsFile {
    pub refresh_interval: u64,
    pub tip_timeout: i64,
    pub leaders_refresh_interval: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfigFile {
    pub timeout_between_restarts: i64,
    pub min_scheduled_time_difference: i64,
    pub send_slots_within: i64,
    pub epoch_start_time: EpochStartTime,
    pub pool_id_file: String,
    pub genesis_hash_file: String,
}

/// Structural overlay merge: scalars in `overlay` replace scalars in
/// `template`; lists are positionally overlaid (and extended if the
/// overlay is longer); dicts recurse. Mirrors
/// `original_source/jmanager/configurations.py::_fillTemplate`.
pub fn overlay_merge(template: &mut serde_json::Value, overlay: &serde_json::Value) {
    match overlay {
        serde_json::Value::Object(overlay_map) => {
            if !template.is_object() {
                *template = serde_json::Value::Object(serde_json::Map::new());
            }
            let template_map = template.as_object_mut().unwrap();
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_object() || overlay_value.is_array() {
                    let entry = template_map
                        .entry(key.clone())
                        .or_insert_with(|| overlay_value.clone());
                    overlay_merge(entry, overlay_value);
                } else {
                    template_map.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        serde_json::Value::Array(overlay_items) => {
            if !template.is_array() {
                *template = serde_json::Value::Array(Vec::new());
            }
            let template_items = template.as_array_mut().unwrap();
            for (idx, overlay_item) in overlay_items.iter().enumerate() {
                if idx >= template_items.len() {
                    template_items.push(overlay_item.clone());
                } else {
                    overlay_merge(&mut template_items[idx], overlay_item);
                }
            }
        }
        _ => {
            *template = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_leaves_are_replaced() {
        let mut template = json!({"a": 1, "b": "x"});
        let overlay = json!({"a": 2});
        overlay_merge(&mut template, &overlay);
        assert_eq!(template, json!({"a": 2, "b": "x"}));
    }

    #[test]
    fn dicts_recurse() {
        let mut template = json!({"p2p": {"trusted_peers": ["a"], "port": 1}});
        let overlay = json!({"p2p": {"port": 2}});
        overlay_merge(&mut template, &overlay);
        assert_eq!(template, json!({"p2p": {"trusted_peers": ["a"], "port": 2}}));
    }

    #[test]
    fn lists_overlay_positionally_and_extend() {
        let mut template = json!({"peers": ["a"]});
        let overlay = json!({"peers": ["x", "y"]});
        overlay_merge(&mut template, &overlay);
        assert_eq!(template, json!({"peers": ["x", "y"]}));
    }
}
