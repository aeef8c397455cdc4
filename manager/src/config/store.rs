// File: manager/src/config/store.rs
use super::{
    overlay_merge, CommonConfig, ConfigSnapshot, EpochStartTime, ManagerConfig, NodeConfig,
};
use crate::errors::ConfigError;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Versioned view of the merged configuration.
///
/// Reload is polled, not pushed: `is_config_update_needed` compares the
/// on-disk mtimes of the template and main config files against the
/// caller's last-seen version timestamp, mirroring
/// `original_source/jmanager/configurations.py`.
pub struct ConfigStore {
    main_path: PathBuf,
    template_path: PathBuf,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    last_checked: RwLock<SystemTime>,
}

impl ConfigStore {
    pub async fn load(main_path: impl AsRef<Path>, template_path: impl AsRef<Path>) -> Result<Self> {
        let main_path = main_path.as_ref().to_path_buf();
        let template_path = template_path.as_ref().to_path_buf();

        let snapshot = Self::build_snapshot(&main_path, &template_path).await?;

        info!(
            "configuration loaded: {} nodes from {} (template {})",
            snapshot.nodes.len(),
            main_path.display(),
            template_path.display()
        );

        Ok(Self {
            main_path,
            template_path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            last_checked: RwLock::new(SystemTime::now()),
        })
    }

    /// Writes every node's merged config to its on-disk config file.
    /// Must be called once at startup, before any NodeMonitor starts
    /// (§4.1: "each per-node merged JSON is written to its node config
    /// file before any monitor starts").
    pub async fn write_all_node_configs(&self) -> Result<()> {
        let snapshot = self.get().await;
        for node in snapshot.nodes.values() {
            write_node_config_file(node).await?;
        }
        Ok(())
    }

    pub async fn get(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn version(&self) -> SystemTime {
        *self.last_checked.read().await
    }

    /// True iff any source file's mtime exceeds the last check time, or
    /// `last_seen` is `None` (first use always triggers a refresh).
    pub async fn is_config_update_needed(&self, last_seen: Option<SystemTime>) -> bool {
        let last_seen = match last_seen {
            None => return true,
            Some(ts) => ts,
        };

        let main_mtime = file_mtime(&self.main_path).await;
        let template_mtime = file_mtime(&self.template_path).await;

        matches!(main_mtime, Some(t) if t > last_seen) || matches!(template_mtime, Some(t) if t > last_seen)
    }

    /// Re-reads and re-merges the configuration if the on-disk files
    /// changed since the last check; returns the (possibly unchanged)
    /// current snapshot and version timestamp.
    pub async fn refresh_if_needed(&self, last_seen: Option<SystemTime>) -> Result<(Arc<ConfigSnapshot>, SystemTime)> {
        if self.is_config_update_needed(last_seen).await {
            let fresh = Self::build_snapshot(&self.main_path, &self.template_path).await?;
            let mut guard = self.snapshot.write().await;
            *guard = Arc::new(fresh);
            let mut checked = self.last_checked.write().await;
            *checked = SystemTime::now();
            return Ok((guard.clone(), *checked));
        }

        Ok((self.get().await, self.version().await))
    }

    async fn build_snapshot(main_path: &Path, template_path: &Path) -> Result<ConfigSnapshot> {
        let template_text = tokio::fs::read_to_string(template_path)
            .await
            .map_err(|e| ConfigError::LoadFailed {
                path: template_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let template: serde_json::Value =
            serde_json::from_str(&template_text).map_err(|e| ConfigError::ParseError {
                path: template_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let main_text = tokio::fs::read_to_string(main_path)
            .await
            .map_err(|e| ConfigError::LoadFailed {
                path: main_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let main_file: super::MainConfigFile =
            serde_json::from_str(&main_text).map_err(|e| ConfigError::ParseError {
                path: main_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut nodes = HashMap::new();
        for entry in &main_file.nodes_config {
            let mut merged = template.clone();
            overlay_merge(&mut merged, &entry.config);

            let listen = merged
                .get("rest")
                .and_then(|r| r.get("listen"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("node '{}' config missing rest.listen", entry.node_name))?
                .to_string();
            let (host, port) = split_host_port(&listen)?;

            let config_file_path = format!(
                "{}/{}.json",
                entry.jmanager_settings.node_path, entry.node_name
            );

            nodes.insert(
                entry.node_name.clone(),
                NodeConfig {
                    node_name: entry.node_name.clone(),
                    config_file_path,
                    rest_scheme: "http".to_string(),
                    rest_host: host,
                    rest_port: port,
                    rest_base: "/api".to_string(),
                    cli_tool_path: format!("{}/jcli", entry.jmanager_settings.node_path),
                    supervisor_service_name: entry.jmanager_settings.supervisor_service_name.clone(),
                    default_trusted_peers: entry.jmanager_settings.default_trusted_peers.clone(),
                    secret_file_path: format!(
                        "{}/{}",
                        main_file.common_config.jormungandr.common_dir,
                        main_file.common_config.jormungandr.secret
                    ),
                    merged_config: merged,
                },
            );
        }

        let common = CommonConfig {
            refresh_interval_sec: main_file.common_config.jormungandr.timeouts.refresh_interval,
            tip_timeout_sec: main_file.common_config.jormungandr.timeouts.tip_timeout,
            tip_diff_threshold: main_file.common_config.jormungandr.tip_diff_threshold,
            leaders_refresh_interval_sec: main_file
                .common_config
                .jormungandr
                .timeouts
                .leaders_refresh_interval,
            restarts_log_path: format!(
                "{}/{}",
                main_file.common_config.jormungandr.common_dir,
                main_file.common_config.jormungandr.restarts_log_filename
            ),
            supervisor_rpc_url: main_file.common_config.jormungandr.supervisor_rest_api_url.clone(),
        };

        let pool_id = read_trimmed_file(&main_file.common_config.manager.pool_id_file)
            .await
            .with_context(|| format!("reading pool_id_file {}", main_file.common_config.manager.pool_id_file))?;
        let genesis_hash = read_trimmed_file(&main_file.common_config.manager.genesis_hash_file)
            .await
            .with_context(|| format!("reading genesis_hash_file {}", main_file.common_config.manager.genesis_hash_file))?;

        let manager = ManagerConfig {
            timeout_between_restarts_sec: main_file.common_config.manager.timeout_between_restarts,
            min_scheduled_time_difference_sec: main_file.common_config.manager.min_scheduled_time_difference,
            send_slots_within_sec: main_file.common_config.manager.send_slots_within,
            epoch_start_time: EpochStartTime {
                hour: main_file.common_config.manager.epoch_start_time.hour,
                minute: main_file.common_config.manager.epoch_start_time.minute,
                second: main_file.common_config.manager.epoch_start_time.second,
            },
            pool_id,
            genesis_hash,
        };

        debug!("merged configuration for {} nodes", nodes.len());

        Ok(ConfigSnapshot {
            nodes,
            common,
            manager,
            email: main_file.common_config.email,
            pool_tool: main_file.common_config.pooltool,
        })
    }
}

async fn read_trimmed_file(path: &str) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content.trim().to_string())
}

fn split_host_port(listen: &str) -> Result<(String, u16)> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid rest.listen value '{}'", listen))?;
    let port: u16 = port.parse().with_context(|| format!("invalid port in '{}'", listen))?;
    Ok((host.to_string(), port))
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Atomic overwrite of a node's on-disk config file with its merged JSON.
pub async fn write_node_config_file(node: &NodeConfig) -> Result<()> {
    let body = serde_json::to_string_pretty(&node.merged_config)?;
    let tmp_path = format!("{}.tmp", node.config_file_path);
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, &node.config_file_path).await?;
    Ok(())
}
