// File: manager/src/fleet_manager.rs
//! The singleton tick loop: reads every `NodeMonitor` once per tick,
//! elects a leader, schedules slot-assignment work, and drives recovery
//! actions. Grounded in `original_source/jmanager/manager.py::Manager`.

use crate::config::ConfigStore;
use crate::fleet_view::FleetRegistry;
use crate::node_client::LeaderLogEntry;
use crate::node_monitor::{NodeMonitor, NodeState};
use crate::notifier::{NotificationEvent, Notifier};
use crate::slot_packager::SlotPackager;
use crate::telemetry::TelemetryPublisher;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const LOOP_INTERVAL_SEC: u64 = 1;
const MAX_TRACKED_EPOCHS: usize = 2;
const SEND_SLOTS_WINDOW_SEC: i64 = 60;
const LEADER_HYSTERESIS_MARGIN: i64 = 3;

struct LeaderRecord {
    leader_id: i64,
    node_name: String,
}

struct SlotAssignment {
    epoch: i64,
    nodes: Vec<String>,
    slots: Vec<LeaderLogEntry>,
}

pub struct FleetManager {
    registry: Arc<FleetRegistry>,
    config_store: Arc<ConfigStore>,
    telemetry: TelemetryPublisher,
    notifier: Arc<dyn Notifier>,
    nodes_max_tip: RwLock<u64>,
    leader_node: RwLock<Option<String>>,
    slots_assigned: RwLock<Vec<SlotAssignment>>,
    slots_sent_epoch: RwLock<Option<i64>>,
    config_last_seen: RwLock<Option<SystemTime>>,
}

impl FleetManager {
    pub fn new(registry: Arc<FleetRegistry>, config_store: Arc<ConfigStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry,
            config_store,
            telemetry: TelemetryPublisher::new(),
            notifier,
            nodes_max_tip: RwLock::new(0),
            leader_node: RwLock::new(None),
            slots_assigned: RwLock::new(Vec::new()),
            slots_sent_epoch: RwLock::new(None),
            config_last_seen: RwLock::new(None),
        }
    }

    /// Ticks forever at `LOOP_INTERVAL_SEC`. A tick that takes longer than
    /// the interval is not doubled up on — the sleep is simply shorter
    /// next time around, matching the "skip work when now - dt < interval"
    /// clause in §4.5.
    pub async fn run(self: Arc<Self>) {
        loop {
            let started = tokio::time::Instant::now();
            if let Err(e) = self.tick().await {
                error!("fleet manager tick failed: {}", e);
            }
            let elapsed = started.elapsed();
            let interval = Duration::from_secs(LOOP_INTERVAL_SEC);
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let snapshot = self.config_store.get().await;

        self.telemetry.refresh_status_summary(&snapshot.pool_tool).await;
        self.telemetry.send_my_tip(&snapshot.pool_tool).await;

        self.refresh_config().await?;

        let leader = self.check_leaders().await;

        if let Some(leader) = &leader {
            self.check_slot_assignments(leader).await;
            self.send_slots(leader, &snapshot).await;
            self.restart_nodes_for_slot_assignments(leader, snapshot.manager.min_scheduled_time_difference_sec).await;
        }

        self.recovery_pass(&snapshot).await;

        Ok(())
    }

    async fn refresh_config(&self) -> anyhow::Result<()> {
        let mut last_seen = self.config_last_seen.write().await;
        let (_, version) = self.config_store.refresh_if_needed(*last_seen).await?;
        *last_seen = Some(version);
        Ok(())
    }

    /// Elects the fleet's single leader, with a `-3` hysteresis margin on
    /// tip comparison to avoid thrashing between nodes whose tips are
    /// within noise of each other. Returns the reconciled leader monitor,
    /// if any — this is the authoritative "current leader" for the rest
    /// of this tick's steps (not a stale pre-reconciliation snapshot).
    async fn check_leaders(&self) -> Option<Arc<NodeMonitor>> {
        let monitors = self.registry.all();
        let mut max_tip_node: Option<Arc<NodeMonitor>> = None;
        let mut running_max: i64 = 0;
        let mut leader_records: Vec<LeaderRecord> = Vec::new();

        for monitor in &monitors {
            if monitor.state() != NodeState::Started {
                continue;
            }

            let tip = monitor.get_tip().await as i64;
            if max_tip_node.is_none() || tip >= running_max + LEADER_HYSTERESIS_MARGIN {
                max_tip_node = Some(monitor.clone());
                running_max = tip;
            }

            let leaders = monitor.get_leaders().await;
            if let Some(&leader_id) = leaders.first() {
                leader_records.push(LeaderRecord { leader_id, node_name: monitor.node_name().to_string() });
            }
        }

        let Some(max_node) = max_tip_node else {
            *self.leader_node.write().await = None;
            return None;
        };

        match leader_records.len() {
            0 => {
                if let Ok(Some(_)) = max_node.register_leader().await {
                    self.notifier.notify(NotificationEvent::Leader { node_name: max_node.node_name().to_string() });
                }
            }
            1 => {
                let record = &leader_records[0];
                if record.node_name != max_node.node_name() {
                    // Register on the new leader before unregistering the
                    // old one, so there is never a leaderless window.
                    if let Ok(Some(_)) = max_node.register_leader().await {
                        self.notifier.notify(NotificationEvent::Leader { node_name: max_node.node_name().to_string() });
                    }
                    if let Some(old) = self.registry.get(&record.node_name) {
                        if let Err(e) = old.unregister_leader(record.leader_id).await {
                            error!("failed to unregister stale leader on {}: {}", record.node_name, e);
                        }
                    }
                }
            }
            count => {
                warn!("multiple leaders detected ({}), reconciling to {}", count, max_node.node_name());
                let mut kept_on_max_node = false;
                for record in &leader_records {
                    let is_max_node = record.node_name == max_node.node_name();
                    let keep = is_max_node && !kept_on_max_node;
                    if is_max_node {
                        kept_on_max_node = true;
                    }
                    if !keep {
                        if let Some(monitor) = self.registry.get(&record.node_name) {
                            if let Err(e) = monitor.unregister_leader(record.leader_id).await {
                                error!("failed to unregister duplicate leader on {}: {}", record.node_name, e);
                            }
                        }
                    }
                }
            }
        }

        *self.leader_node.write().await = Some(max_node.node_name().to_string());
        Some(max_node)
    }

    async fn check_slot_assignments(&self, leader: &Arc<NodeMonitor>) {
        let current_epoch = leader.get_current_epoch().await;

        {
            let assigned = self.slots_assigned.read().await;
            if assigned.iter().any(|a| a.epoch == current_epoch) {
                return;
            }
        }

        let logs = match leader.get_leaders_logs().await {
            Ok(logs) => logs,
            Err(e) => {
                error!("failed to fetch leader logs from {}: {}", leader.node_name(), e);
                return;
            }
        };

        let slot_count = logs.len();
        {
            let mut assigned = self.slots_assigned.write().await;
            assigned.push(SlotAssignment {
                epoch: current_epoch,
                nodes: vec![leader.node_name().to_string()],
                slots: logs,
            });
            if assigned.len() > MAX_TRACKED_EPOCHS {
                assigned.remove(0);
            }
        }

        self.notifier.notify(NotificationEvent::SlotsAssigned { node_name: leader.node_name().to_string(), slot_count });
    }

    async fn send_slots(&self, leader: &Arc<NodeMonitor>, snapshot: &crate::config::ConfigSnapshot) {
        let current_epoch = leader.get_current_epoch().await;

        if *self.slots_sent_epoch.read().await == Some(current_epoch) {
            return;
        }

        let epoch_start = today_at(&snapshot.manager.epoch_start_time);
        let now = Utc::now();
        if now < epoch_start {
            return;
        }
        let elapsed = (now - epoch_start).num_seconds();

        let within_window = snapshot.manager.send_slots_within_sec;
        if elapsed < within_window || elapsed >= within_window + SEND_SLOTS_WINDOW_SEC {
            return;
        }

        let logs = match leader.get_leaders_logs().await {
            Ok(logs) => logs,
            Err(e) => {
                error!("failed to fetch leader logs for slot send: {}", e);
                return;
            }
        };

        let packager = SlotPackager::new(
            &snapshot.pool_tool.send_slots,
            snapshot.manager.pool_id.clone(),
            snapshot.manager.genesis_hash.clone(),
            snapshot.pool_tool.user_id.clone(),
        );
        self.telemetry.send_slots(&packager, current_epoch, &logs).await;
        *self.slots_sent_epoch.write().await = Some(current_epoch);
    }

    async fn restart_nodes_for_slot_assignments(&self, leader: &Arc<NodeMonitor>, min_scheduled_time_difference_sec: i64) {
        let current_epoch = leader.get_current_epoch().await;

        let recorded_dates: Option<Vec<String>> = {
            let assigned = self.slots_assigned.read().await;
            assigned.iter().find(|a| a.epoch == current_epoch).map(|a| {
                let mut dates: Vec<String> = a.slots.iter().map(|s| s.scheduled_at_date.clone()).collect();
                dates.sort();
                dates
            })
        };
        let Some(recorded_dates) = recorded_dates else {
            return;
        };
        let recorded_has_slots = !recorded_dates.is_empty();

        for monitor in self.registry.all() {
            if monitor.node_name() == leader.node_name() {
                continue;
            }
            if monitor.state() != NodeState::Started {
                continue;
            }

            let already_confirmed = {
                let assigned = self.slots_assigned.read().await;
                assigned
                    .iter()
                    .find(|a| a.epoch == current_epoch)
                    .map(|a| a.nodes.iter().any(|n| n == monitor.node_name()))
                    .unwrap_or(false)
            };
            if already_confirmed {
                continue;
            }

            let node_slots = match monitor.get_leaders_logs().await {
                Ok(slots) => slots,
                Err(e) => {
                    error!("failed to fetch leader logs from {}: {}", monitor.node_name(), e);
                    continue;
                }
            };
            let mut node_dates: Vec<String> = node_slots.iter().map(|s| s.scheduled_at_date.clone()).collect();
            node_dates.sort();

            if node_dates == recorded_dates {
                let mut assigned = self.slots_assigned.write().await;
                if let Some(item) = assigned.iter_mut().find(|a| a.epoch == current_epoch) {
                    item.nodes.push(monitor.node_name().to_string());
                }
                continue;
            }

            if !node_slots.is_empty() {
                error!("{} reports a different slot schedule than the leader", monitor.node_name());
                continue;
            }

            if !recorded_has_slots {
                continue;
            }

            let closest = {
                let assigned = self.slots_assigned.read().await;
                assigned.iter().find(|a| a.epoch == current_epoch).and_then(|a| closest_future_slot_time(&a.slots))
            };
            let Some(closest_time) = closest else {
                continue;
            };

            let far_enough = (closest_time - Utc::now()).num_seconds() >= min_scheduled_time_difference_sec;
            let other_up = self.registry.any_other_started(monitor.node_name());

            if far_enough && other_up {
                if let Err(e) = monitor.restart("leader logs").await {
                    error!("failed to restart {} for missing slot assignment: {}", monitor.node_name(), e);
                }
            } else {
                warn!("{} reports no slots while the leader has some", monitor.node_name());
            }
        }
    }

    async fn recovery_pass(&self, snapshot: &crate::config::ConfigSnapshot) {
        let monitors = self.registry.all();
        let any_up = monitors.iter().any(|m| m.state() == NodeState::Started);

        for monitor in &monitors {
            match monitor.state() {
                NodeState::Started => self.recover_started(monitor, snapshot).await,
                NodeState::Bootstrapping => self.recover_bootstrapping(monitor, snapshot).await,
                NodeState::Stopped => self.recover_stopped(monitor).await,
                NodeState::Unknown => {
                    if !any_up {
                        self.start_all_nodes().await;
                    }
                }
            }
        }
    }

    async fn recover_started(&self, monitor: &Arc<NodeMonitor>, snapshot: &crate::config::ConfigSnapshot) {
        let tip = monitor.get_tip().await;

        let exceeded = {
            let current = *self.nodes_max_tip.read().await;
            tip > current
        };
        if exceeded {
            *self.nodes_max_tip.write().await = tip;
            if let Some(stats) = monitor.get_last_stats().await {
                match monitor.get_last_block().await {
                    Ok(Some(block_hex)) => {
                        self.telemetry
                            .refresh_data_for_tip_update(&stats, &block_hex, &snapshot.manager.pool_id, &snapshot.manager.genesis_hash, &snapshot.pool_tool.user_id)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("failed to fetch last block from {}: {}", monitor.node_name(), e),
                }
            }
        }

        let combined_max_tip = self.combined_max_tip().await;
        if monitor.is_stuck(combined_max_tip).await {
            info!("{}: restarting, tip stuck relative to fleet max {}", monitor.node_name(), combined_max_tip);
            if let Err(e) = monitor.restart("staled tip").await {
                error!("failed to restart stuck node {}: {}", monitor.node_name(), e);
            }
            self.notifier.notify(NotificationEvent::Stuck { node_name: monitor.node_name().to_string(), tip_timeout_min: 0.0 });
        }
    }

    async fn recover_bootstrapping(&self, monitor: &Arc<NodeMonitor>, snapshot: &crate::config::ConfigSnapshot) {
        let elapsed = monitor.get_seconds_since_bootstrap_started().await;
        let timeout = snapshot.manager.timeout_between_restarts_sec;
        if elapsed <= timeout {
            return;
        }

        if self.registry.any_other_started(monitor.node_name()) {
            if let Err(e) = monitor.restart("boot timeout").await {
                error!("failed to restart stalled bootstrap on {}: {}", monitor.node_name(), e);
            }
        } else {
            if let Err(e) = monitor.force_default_peers().await {
                error!("failed to switch {} to default peers: {}", monitor.node_name(), e);
            }
            if let Err(e) = monitor.restart("boot timeout").await {
                error!("failed to restart stalled bootstrap on {}: {}", monitor.node_name(), e);
            }
            if let Err(e) = monitor.force_fast_peers().await {
                error!("failed to switch {} back to fast peers: {}", monitor.node_name(), e);
            }
        }

        self.notifier.notify(NotificationEvent::BootstrapRestart {
            node_name: monitor.node_name().to_string(),
            timeout_min: timeout as f64 / 60.0,
        });
    }

    async fn recover_stopped(&self, monitor: &Arc<NodeMonitor>) {
        if self.registry.any_other_started(monitor.node_name()) {
            if let Err(e) = monitor.start_node("auto start").await {
                error!("failed to start {}: {}", monitor.node_name(), e);
            }
        } else {
            self.start_all_nodes().await;
        }
    }

    async fn start_all_nodes(&self) {
        for monitor in self.registry.all() {
            if monitor.state() != NodeState::Stopped {
                continue;
            }
            if let Err(e) = monitor.force_default_peers().await {
                error!("failed to switch {} to default peers before cold start: {}", monitor.node_name(), e);
            }
            if let Err(e) = monitor.start_node("cold start").await {
                error!("failed to start {}: {}", monitor.node_name(), e);
            }
        }
    }

    async fn combined_max_tip(&self) -> u64 {
        let nodes_max = *self.nodes_max_tip.read().await;
        let telemetry_max = self.telemetry.get_max_tip().await;
        nodes_max.max(telemetry_max)
    }
}

fn today_at(t: &crate::config::EpochStartTime) -> DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), t.hour, t.minute, t.second)
        .single()
        .unwrap_or(now)
}

fn closest_future_slot_time(slots: &[LeaderLogEntry]) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    slots
        .iter()
        .filter_map(|s| DateTime::parse_from_rfc3339(&s.scheduled_at_time).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| *dt > now)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(date: &str, time: &str) -> LeaderLogEntry {
        LeaderLogEntry {
            scheduled_at_date: date.to_string(),
            scheduled_at_time: time.to_string(),
            finished_at_time: None,
        }
    }

    #[test]
    fn closest_future_slot_time_ignores_past_entries() {
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let slots = vec![entry("7.1", &past), entry("7.2", &future)];
        let closest = closest_future_slot_time(&slots);
        assert!(closest.is_some());
        assert!(closest.unwrap() > Utc::now());
    }

    #[test]
    fn closest_future_slot_time_none_when_all_past() {
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let slots = vec![entry("7.1", &past)];
        assert!(closest_future_slot_time(&slots).is_none());
    }

    #[test]
    fn today_at_uses_requested_wall_clock_fields() {
        let t = crate::config::EpochStartTime { hour: 3, minute: 30, second: 0 };
        let dt = today_at(&t);
        assert_eq!(dt.hour(), 3);
        assert_eq!(dt.minute(), 30);
    }
}
