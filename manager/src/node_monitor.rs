// File: manager/src/node_monitor.rs
//! One task per node: owns the node's observed state machine, polls its
//! CLI/REST status, and drives SupervisorClient/NodeClient on its behalf.
//!
//! Mutation of observed state happens only inside this module's own
//! methods (`&self`, taking the write lock internally) — FleetManager
//! only ever calls the read-only accessors and the explicit action
//! methods below.

use crate::config::{CommonConfig, NodeConfig};
use crate::config::ConfigStore;
use crate::errors::CliErrorKind;
use crate::fleet_view::FleetView;
use crate::node_client::{CliMutex, LeaderLogEntry, NodeClient, NodeStats, StatsOutcome};
use crate::supervisor_client::SupervisorClient;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Started,
    Bootstrapping,
    Stopped,
}

impl NodeState {
    fn to_u8(self) -> u8 {
        match self {
            NodeState::Unknown => 0,
            NodeState::Started => 1,
            NodeState::Bootstrapping => 2,
            NodeState::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeState::Started,
            2 => NodeState::Bootstrapping,
            3 => NodeState::Stopped,
            _ => NodeState::Unknown,
        }
    }
}

impl From<crate::supervisor_client::SupervisorState> for NodeState {
    fn from(s: crate::supervisor_client::SupervisorState) -> Self {
        use crate::supervisor_client::SupervisorState as S;
        match s {
            S::Started => NodeState::Started,
            S::Bootstrapping => NodeState::Bootstrapping,
            S::Stopped => NodeState::Stopped,
            S::Unknown => NodeState::Unknown,
        }
    }
}

#[derive(Default)]
struct ObservedNodeInner {
    current_stats: Option<NodeStats>,
    previous_stats: Option<NodeStats>,
    last_progress_time: Option<DateTime<Utc>>,
    leaders: Vec<i64>,
    last_leaders_check_time: Option<DateTime<Utc>>,
    default_peers_enabled: bool,
    bootstrap_started_at: Option<DateTime<Utc>>,
}

struct RuntimeConfig {
    node: NodeConfig,
    refresh_interval_sec: u64,
    tip_timeout_sec: i64,
    tip_diff_threshold: i64,
    leaders_refresh_interval_sec: i64,
    restarts_log_path: String,
}

pub struct NodeMonitor {
    node_name: String,
    cli_mutex: CliMutex,
    node_client: RwLock<NodeClient>,
    supervisor: Arc<SupervisorClient>,
    fleet_view: OnceLock<Arc<dyn FleetView>>,
    runtime: RwLock<RuntimeConfig>,
    fast_trusted_peers: RwLock<serde_json::Value>,
    state: AtomicU8,
    inner: RwLock<ObservedNodeInner>,
}

impl NodeMonitor {
    pub fn new(
        node_config: NodeConfig,
        common: CommonConfig,
        node_client: NodeClient,
        cli_mutex: CliMutex,
        supervisor: Arc<SupervisorClient>,
    ) -> Self {
        let fast_trusted_peers = node_config
            .merged_config
            .get("p2p")
            .and_then(|p2p| p2p.get("trusted_peers"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));

        let node_name = node_config.node_name.clone();
        let runtime = RuntimeConfig {
            node: node_config,
            refresh_interval_sec: common.refresh_interval_sec,
            tip_timeout_sec: common.tip_timeout_sec,
            tip_diff_threshold: common.tip_diff_threshold,
            leaders_refresh_interval_sec: common.leaders_refresh_interval_sec,
            restarts_log_path: common.restarts_log_path,
        };

        Self {
            node_name,
            cli_mutex,
            node_client: RwLock::new(node_client),
            supervisor,
            fleet_view: OnceLock::new(),
            runtime: RwLock::new(runtime),
            fast_trusted_peers: RwLock::new(fast_trusted_peers),
            state: AtomicU8::new(NodeState::Unknown.to_u8()),
            inner: RwLock::new(ObservedNodeInner::default()),
        }
    }

    /// Bound once, after every monitor is constructed and registered in
    /// the `FleetRegistry` (§9 design note: a capability, not a graph).
    pub fn bind_fleet_view(&self, view: Arc<dyn FleetView>) {
        let _ = self.fleet_view.set(view);
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    /// Drives the node forever: config refresh, a stats poll, the
    /// trusted-peer toggle, then sleeps `refresh_interval_sec`. Any error
    /// inside one iteration is logged and the loop continues (§7).
    pub async fn run(self: Arc<Self>, config_store: Arc<ConfigStore>) {
        let mut last_seen: Option<SystemTime> = None;
        loop {
            if let Err(e) = self.refresh_config_if_needed(&config_store, &mut last_seen).await {
                error!("{}: config refresh failed: {}", self.node_name, e);
            }

            self.poll_once().await;

            if let Err(e) = self.apply_trusted_peer_policy().await {
                error!("{}: trusted-peer toggle failed: {}", self.node_name, e);
            }

            let sleep_for = self.runtime.read().await.refresh_interval_sec;
            tokio::time::sleep(std::time::Duration::from_secs(sleep_for)).await;
        }
    }

    async fn refresh_config_if_needed(
        &self,
        store: &ConfigStore,
        last_seen: &mut Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let (snapshot, version) = store.refresh_if_needed(*last_seen).await?;
        if *last_seen == Some(version) {
            return Ok(());
        }
        *last_seen = Some(version);

        let node_config = snapshot
            .node(&self.node_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no configuration found for node '{}'", self.node_name))?;

        self.node_client
            .read()
            .await
            .write_config(&node_config.config_file_path, &node_config.merged_config)
            .await?;

        *self.fast_trusted_peers.write().await = node_config
            .merged_config
            .get("p2p")
            .and_then(|p2p| p2p.get("trusted_peers"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));

        let mut client = self.node_client.write().await;
        *client = NodeClient::new(node_config.cli_tool_path.clone(), node_config.rest_host.clone(), self.cli_mutex.clone());
        drop(client);

        let mut runtime = self.runtime.write().await;
        runtime.refresh_interval_sec = snapshot.common.refresh_interval_sec;
        runtime.tip_timeout_sec = snapshot.common.tip_timeout_sec;
        runtime.tip_diff_threshold = snapshot.common.tip_diff_threshold;
        runtime.leaders_refresh_interval_sec = snapshot.common.leaders_refresh_interval_sec;
        runtime.restarts_log_path = snapshot.common.restarts_log_path.clone();
        runtime.node = node_config;

        debug!("{}: config refreshed", self.node_name);
        Ok(())
    }

    async fn poll_once(&self) {
        let outcome = self.node_client.read().await.get_stats().await;
        match outcome {
            Ok(StatsOutcome::Bootstrapping) => {
                self.set_state(NodeState::Bootstrapping);
                self.ensure_bootstrap_started_at().await;
            }
            Ok(StatsOutcome::Stats(stats)) => {
                self.set_state(NodeState::Started);
                self.apply_monotone_stats(stats).await;
            }
            Ok(StatsOutcome::NotReady) => {
                self.sync_state_from_supervisor().await;
                self.clear_stats().await;
            }
            Err(e) => match e.kind {
                CliErrorKind::FailedRestRequest | CliErrorKind::AddressAlreadyInUse => {
                    warn!("{}: cli error {:?}, stopping node", self.node_name, e.kind);
                    if let Err(stop_err) = self.stop_node(true, &format!("cli error: {:?}", e.kind)).await {
                        error!("{}: failed to stop after cli error: {}", self.node_name, stop_err);
                    }
                }
                CliErrorKind::Unknown => {
                    error!("{}: unclassified cli error: {}", self.node_name, e);
                }
            },
        }
    }

    async fn apply_monotone_stats(&self, stats: NodeStats) {
        let mut inner = self.inner.write().await;
        match inner.previous_stats.clone() {
            None => {
                inner.previous_stats = Some(stats.clone());
                inner.current_stats = Some(stats);
                inner.last_progress_time = Some(Utc::now());
            }
            Some(prev) => {
                if stats.last_block_height > prev.last_block_height {
                    inner.previous_stats = inner.current_stats.take();
                    inner.current_stats = Some(stats);
                    inner.last_progress_time = Some(Utc::now());
                }
            }
        }
    }

    async fn clear_stats(&self) {
        let mut inner = self.inner.write().await;
        inner.current_stats = None;
        inner.previous_stats = None;
        inner.last_progress_time = None;
        inner.leaders.clear();
    }

    async fn sync_state_from_supervisor(&self) {
        let service = self.runtime.read().await.node.supervisor_service_name.clone();
        match self.supervisor.get_info(&service).await {
            Ok(info) => self.set_state(info.state.into()),
            Err(e) => error!("{}: failed to query supervisor state: {}", self.node_name, e),
        }
    }

    async fn ensure_bootstrap_started_at(&self) {
        let mut inner = self.inner.write().await;
        if inner.bootstrap_started_at.is_none() {
            inner.bootstrap_started_at = Some(Utc::now());
        }
    }

    pub async fn get_tip(&self) -> u64 {
        self.inner.read().await.current_stats.as_ref().map(|s| s.last_block_height).unwrap_or(0)
    }

    pub async fn get_uptime(&self) -> i64 {
        self.inner.read().await.current_stats.as_ref().map(|s| s.uptime_sec).unwrap_or(-1)
    }

    pub async fn get_last_stats(&self) -> Option<NodeStats> {
        self.inner.read().await.current_stats.clone()
    }

    pub async fn get_last_block(&self) -> anyhow::Result<Option<String>> {
        if self.state() != NodeState::Started {
            return Ok(None);
        }
        let hash = match self.inner.read().await.current_stats.clone() {
            Some(stats) => stats.last_block_hash,
            None => return Ok(None),
        };
        let hex = self.node_client.read().await.get_block(&hash).await?;
        Ok(Some(hex))
    }

    pub async fn get_current_epoch(&self) -> i64 {
        self.inner.read().await.current_stats.as_ref().map(|s| s.epoch()).unwrap_or(0)
    }

    /// Cache-aware: re-fetches only when the cached value is older than
    /// `leaders_refresh_interval_sec`, and falls back to the cache when
    /// the fleet-wide CLI mutex is contended (§5).
    pub async fn get_leaders(&self) -> Vec<i64> {
        if self.state() != NodeState::Started {
            return Vec::new();
        }

        let refresh_interval = self.runtime.read().await.leaders_refresh_interval_sec;
        let needs_refresh = match self.inner.read().await.last_leaders_check_time {
            None => true,
            Some(t) => (Utc::now() - t).num_seconds() > refresh_interval,
        };

        if !needs_refresh {
            return self.inner.read().await.leaders.clone();
        }

        match self.node_client.read().await.try_get_leaders().await {
            Ok(Some(ids)) => {
                let mut inner = self.inner.write().await;
                inner.leaders = ids.clone();
                inner.last_leaders_check_time = Some(Utc::now());
                ids
            }
            Ok(None) => self.inner.read().await.leaders.clone(),
            Err(e) => {
                error!("{}: failed to fetch leaders: {}", self.node_name, e);
                self.inner.read().await.leaders.clone()
            }
        }
    }

    pub async fn is_leader(&self) -> bool {
        !self.inner.read().await.leaders.is_empty()
    }

    pub async fn get_leaders_logs(&self) -> anyhow::Result<Vec<LeaderLogEntry>> {
        if self.state() != NodeState::Started {
            return Ok(Vec::new());
        }
        Ok(self.node_client.read().await.get_leaders_logs().await?)
    }

    /// True if either the tip has been frozen for more than
    /// `tip_timeout_sec`, or the node is more than `tip_diff_threshold`
    /// blocks away from the fleet's max tip. False with no prior reading.
    pub async fn is_stuck(&self, fleet_max_tip: u64) -> bool {
        let inner = self.inner.read().await;
        let Some(current) = &inner.current_stats else {
            return false;
        };
        if inner.previous_stats.is_none() {
            return false;
        }

        let runtime = self.runtime.read().await;

        let frozen = inner
            .last_progress_time
            .map(|t| (Utc::now() - t).num_seconds() > runtime.tip_timeout_sec)
            .unwrap_or(false);
        if frozen {
            warn!("{}: tip frozen at {} for over {}s", self.node_name, current.last_block_height, runtime.tip_timeout_sec);
            return true;
        }

        let diff = (current.last_block_height as i64 - fleet_max_tip as i64).abs();
        if diff > runtime.tip_diff_threshold {
            warn!("{}: tip off by {} from fleet max {}", self.node_name, diff, fleet_max_tip);
            return true;
        }

        false
    }

    pub async fn get_seconds_since_bootstrap_started(&self) -> i64 {
        self.ensure_bootstrap_started_at().await;
        let inner = self.inner.read().await;
        match inner.bootstrap_started_at {
            Some(t) => (Utc::now() - t).num_seconds(),
            None => 0,
        }
    }

    async fn is_supervisor_up(&self) -> bool {
        let service = self.runtime.read().await.node.supervisor_service_name.clone();
        self.supervisor.is_up(&service).await.unwrap_or(false)
    }

    pub async fn stop_node(&self, force: bool, reason: &str) -> anyhow::Result<()> {
        let up = self.is_supervisor_up().await;
        let state = self.state();
        if !(up && (state == NodeState::Started || state == NodeState::Bootstrapping || force)) {
            info!("{}: already stopped", self.node_name);
            return Ok(());
        }

        let uptime = self.get_uptime().await;
        let (service, log_path) = {
            let runtime = self.runtime.read().await;
            (runtime.node.supervisor_service_name.clone(), runtime.restarts_log_path.clone())
        };

        self.append_restart_log(&log_path, "stop", uptime, reason).await?;
        self.supervisor.stop(&service).await?;
        self.set_state(NodeState::Stopped);
        self.clear_stats().await;
        info!("{}: stopped ({})", self.node_name, reason);
        Ok(())
    }

    pub async fn start_node(&self, reason: &str) -> anyhow::Result<()> {
        if self.state() != NodeState::Stopped || self.is_supervisor_up().await {
            info!("{}: already started", self.node_name);
            return Ok(());
        }

        let (service, log_path) = {
            let runtime = self.runtime.read().await;
            (runtime.node.supervisor_service_name.clone(), runtime.restarts_log_path.clone())
        };

        self.append_restart_log(&log_path, "start", -1, reason).await?;
        self.supervisor.start(&service).await?;
        self.clear_stats().await;
        self.set_state(NodeState::Bootstrapping);
        self.inner.write().await.bootstrap_started_at = Some(Utc::now());
        info!("{}: started ({})", self.node_name, reason);
        Ok(())
    }

    pub async fn restart(&self, reason: &str) -> anyhow::Result<()> {
        self.stop_node(true, reason).await?;
        self.start_node(reason).await
    }

    pub async fn register_leader(&self) -> anyhow::Result<Option<i64>> {
        if self.state() != NodeState::Started {
            return Ok(None);
        }
        let secret_file = self.runtime.read().await.node.secret_file_path.clone();
        let leader_id = self.node_client.read().await.register_leader(&secret_file).await?;
        self.inner.write().await.leaders.push(leader_id);
        info!("{}: registered as leader ({})", self.node_name, leader_id);
        Ok(Some(leader_id))
    }

    pub async fn unregister_leader(&self, leader_id: i64) -> anyhow::Result<()> {
        if self.state() != NodeState::Started {
            return Ok(());
        }
        self.node_client.read().await.unregister_leader(leader_id).await?;
        self.inner.write().await.leaders.retain(|id| *id != leader_id);
        info!("{}: unregistered leader {}", self.node_name, leader_id);
        Ok(())
    }

    /// Swaps `p2p.trusted_peers` to the fleet's default set when no other
    /// monitor is `STARTED`, and reverts to the fast-bootstrap peers
    /// captured at config load once another node comes up. Idempotent:
    /// repeated calls in the same regime write the file at most once.
    pub async fn apply_trusted_peer_policy(&self) -> anyhow::Result<()> {
        let Some(fleet_view) = self.fleet_view.get() else {
            return Ok(());
        };
        let any_other_up = fleet_view.any_other_started(&self.node_name);
        let already_default = self.inner.read().await.default_peers_enabled;

        if !any_other_up && !already_default {
            let default_peers = self.runtime.read().await.node.default_trusted_peers.clone();
            self.write_trusted_peers(default_peers).await?;
            self.inner.write().await.default_peers_enabled = true;
        } else if any_other_up && already_default {
            let fast_peers = self.fast_trusted_peers.read().await.clone();
            self.write_trusted_peers(fast_peers).await?;
            self.inner.write().await.default_peers_enabled = false;
        }

        Ok(())
    }

    /// Forces default-peers mode regardless of fleet state. Used by the
    /// one-off bootstrap-timeout recovery path (§4.5 step 7), which is
    /// distinct from the continuous toggle in `apply_trusted_peer_policy`.
    pub async fn force_default_peers(&self) -> anyhow::Result<()> {
        let default_peers = self.runtime.read().await.node.default_trusted_peers.clone();
        self.write_trusted_peers(default_peers).await?;
        self.inner.write().await.default_peers_enabled = true;
        Ok(())
    }

    /// Forces fast-bootstrap peers regardless of fleet state. Counterpart
    /// to `force_default_peers`.
    pub async fn force_fast_peers(&self) -> anyhow::Result<()> {
        let fast_peers = self.fast_trusted_peers.read().await.clone();
        self.write_trusted_peers(fast_peers).await?;
        self.inner.write().await.default_peers_enabled = false;
        Ok(())
    }

    async fn write_trusted_peers(&self, peers: serde_json::Value) -> anyhow::Result<()> {
        let mut runtime = self.runtime.write().await;
        let merged = &mut runtime.node.merged_config;
        if let Some(p2p) = merged.get_mut("p2p").and_then(|v| v.as_object_mut()) {
            p2p.insert("trusted_peers".to_string(), peers);
        }
        let path = runtime.node.config_file_path.clone();
        let body = runtime.node.merged_config.clone();
        drop(runtime);

        self.node_client.read().await.write_config(&path, &body).await?;
        debug!("{}: trusted_peers config file rewritten", self.node_name);
        Ok(())
    }

    async fn append_restart_log(&self, path: &str, action: &str, uptime_sec: i64, reason: &str) -> anyhow::Result<()> {
        let header_needed = tokio::fs::metadata(path).await.is_err();
        let mut line = String::new();
        if header_needed {
            line.push_str("node name, timestamp, action, uptime, reason\n");
        }
        line.push_str(&format!(
            "{},{},{},{},{}\n",
            self.node_name,
            Utc::now().to_rfc3339(),
            action,
            uptime_sec,
            reason
        ));

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::new_cli_mutex;

    fn dummy_node_config(name: &str) -> NodeConfig {
        NodeConfig {
            node_name: name.to_string(),
            config_file_path: format!("/tmp/{}.json", name),
            rest_scheme: "http".to_string(),
            rest_host: "127.0.0.1".to_string(),
            rest_port: 8080,
            rest_base: "/api".to_string(),
            cli_tool_path: "/bin/true".to_string(),
            supervisor_service_name: name.to_string(),
            default_trusted_peers: serde_json::json!(["default-peer"]),
            secret_file_path: "/tmp/secret".to_string(),
            merged_config: serde_json::json!({"p2p": {"trusted_peers": ["fast-peer"]}}),
        }
    }

    fn dummy_common() -> CommonConfig {
        CommonConfig {
            refresh_interval_sec: 1,
            tip_timeout_sec: 30,
            tip_diff_threshold: 3,
            leaders_refresh_interval_sec: 10,
            restarts_log_path: "/tmp/restarts.log".to_string(),
            supervisor_rpc_url: "http://127.0.0.1:9001/RPC2".to_string(),
        }
    }

    fn dummy_monitor(name: &str) -> NodeMonitor {
        let config = dummy_node_config(name);
        let cli_mutex = new_cli_mutex();
        let node_client = NodeClient::new(config.cli_tool_path.clone(), config.rest_host.clone(), cli_mutex.clone());
        let supervisor = Arc::new(SupervisorClient::new("http://127.0.0.1:9001/RPC2"));
        NodeMonitor::new(config, dummy_common(), node_client, cli_mutex, supervisor)
    }

    #[tokio::test]
    async fn first_stats_reading_seeds_both_previous_and_current() {
        let monitor = dummy_monitor("a");
        let stats = NodeStats {
            last_block_height: 10,
            last_block_hash: "abc".into(),
            last_block_date: "5.1".into(),
            uptime_sec: 1,
            version: "v".into(),
        };
        monitor.apply_monotone_stats(stats.clone()).await;
        let inner = monitor.inner.read().await;
        assert_eq!(inner.previous_stats.as_ref().unwrap().last_block_height, 10);
        assert_eq!(inner.current_stats.as_ref().unwrap().last_block_height, 10);
    }

    #[tokio::test]
    async fn stats_only_advance_on_strictly_increasing_height() {
        let monitor = dummy_monitor("a");
        let first = NodeStats { last_block_height: 10, last_block_hash: "a".into(), last_block_date: "5.1".into(), uptime_sec: 1, version: "v".into() };
        let same = NodeStats { last_block_height: 10, last_block_hash: "b".into(), last_block_date: "5.2".into(), uptime_sec: 2, version: "v".into() };
        let higher = NodeStats { last_block_height: 11, last_block_hash: "c".into(), last_block_date: "5.3".into(), uptime_sec: 3, version: "v".into() };

        monitor.apply_monotone_stats(first).await;
        monitor.apply_monotone_stats(same).await;
        {
            let inner = monitor.inner.read().await;
            assert_eq!(inner.previous_stats.as_ref().unwrap().last_block_height, 10);
            assert_eq!(inner.current_stats.as_ref().unwrap().last_block_hash, "a");
        }

        monitor.apply_monotone_stats(higher).await;
        let inner = monitor.inner.read().await;
        assert_eq!(inner.previous_stats.as_ref().unwrap().last_block_height, 10);
        assert_eq!(inner.current_stats.as_ref().unwrap().last_block_height, 11);
    }

    #[tokio::test]
    async fn is_stuck_false_without_previous_reading() {
        let monitor = dummy_monitor("a");
        let stats = NodeStats { last_block_height: 10, last_block_hash: "a".into(), last_block_date: "5.1".into(), uptime_sec: 1, version: "v".into() };
        monitor.apply_monotone_stats(stats).await;
        monitor.inner.write().await.previous_stats = None;
        assert!(!monitor.is_stuck(10).await);
    }

    #[tokio::test]
    async fn is_stuck_true_when_diff_exceeds_threshold() {
        let monitor = dummy_monitor("a");
        let first = NodeStats { last_block_height: 10, last_block_hash: "a".into(), last_block_date: "5.1".into(), uptime_sec: 1, version: "v".into() };
        let second = NodeStats { last_block_height: 11, last_block_hash: "b".into(), last_block_date: "5.2".into(), uptime_sec: 1, version: "v".into() };
        monitor.apply_monotone_stats(first).await;
        monitor.apply_monotone_stats(second).await;
        assert!(monitor.is_stuck(20).await);
    }

    #[tokio::test]
    async fn bootstrap_started_at_is_idempotent() {
        let monitor = dummy_monitor("a");
        monitor.ensure_bootstrap_started_at().await;
        let first = monitor.inner.read().await.bootstrap_started_at;
        monitor.ensure_bootstrap_started_at().await;
        let second = monitor.inner.read().await.bootstrap_started_at;
        assert_eq!(first, second);
    }
}
