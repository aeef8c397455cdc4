// File: manager/src/telemetry.rs
//! Pushes the pool's tip and per-epoch slot schedules to the external
//! aggregator ("pool-tool"). Transport errors are logged and swallowed —
//! telemetry must never crash the control plane (§4.6/§7).

use crate::config::PoolToolConfig;
use crate::node_client::NodeStats;
use crate::slot_packager::SlotPackager;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error};

const PLATFORM_NAME: &str = "fleet-supervisor";

#[derive(Debug, Clone, Serialize)]
pub struct TipRecord {
    pub poolid: String,
    pub userid: String,
    pub genesispref: String,
    pub mytip: u64,
    pub lasthash: String,
    pub lastpool: String,
    pub lastparent: String,
    pub lastslot: i64,
    pub lastepoch: i64,
    pub jormver: String,
    pub platform: String,
}

pub struct TelemetryPublisher {
    client: Client,
    tip_data: RwLock<Option<TipRecord>>,
    tip_last_sent: RwLock<Option<DateTime<Utc>>>,
    status_summary: RwLock<Option<serde_json::Value>>,
    status_last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            tip_data: RwLock::new(None),
            tip_last_sent: RwLock::new(None),
            status_summary: RwLock::new(None),
            status_last_refresh: RwLock::new(None),
        }
    }

    /// Builds a fresh `TipRecord` from the leader's stats and raw block
    /// hex. The header offsets are fixed by the external block format
    /// and must stay byte-exact (§4.6).
    pub async fn refresh_data_for_tip_update(&self, stats: &NodeStats, last_block_hex: &str, pool_id: &str, genesis_hash: &str, user_id: &str) {
        if last_block_hex.len() < 232 {
            error!("block header too short to slice for telemetry: {} bytes", last_block_hex.len());
            return;
        }

        let record = TipRecord {
            poolid: pool_id.to_string(),
            userid: user_id.to_string(),
            genesispref: genesis_hash.to_string(),
            mytip: stats.last_block_height,
            lasthash: stats.last_block_hash.clone(),
            lastpool: last_block_hex[168..232].to_string(),
            lastparent: last_block_hex[104..168].to_string(),
            lastslot: i64::from_str_radix(&last_block_hex[24..32], 16).unwrap_or(0),
            lastepoch: i64::from_str_radix(&last_block_hex[16..24], 16).unwrap_or(0),
            jormver: stats.version.clone(),
            platform: PLATFORM_NAME.to_string(),
        };

        *self.tip_data.write().await = Some(record);
    }

    /// GETs the aggregator's tip endpoint, rate-limited to at most once
    /// per `refresh_rate` seconds.
    pub async fn send_my_tip(&self, pool_tool: &PoolToolConfig) {
        let Some(record) = self.tip_data.read().await.clone() else {
            return;
        };

        let last_sent = *self.tip_last_sent.read().await;
        if let Some(last_sent) = last_sent {
            if (Utc::now() - last_sent).num_seconds() < pool_tool.send_tip.refresh_rate {
                return;
            }
        }

        debug!("sending tip record: {:?}", record);
        match self.client.get(&pool_tool.send_tip.url).query(&record).send().await {
            Ok(resp) => debug!("tip push response: {}", resp.status()),
            Err(e) => error!("failed to send tip to aggregator: {}", e),
        }

        *self.tip_last_sent.write().await = Some(Utc::now());
    }

    /// GETs the status summary endpoint, cached for `refresh_rate`
    /// seconds; `get_max_tip` exposes the cached `majoritymax` field.
    pub async fn refresh_status_summary(&self, pool_tool: &PoolToolConfig) {
        let last_refresh = *self.status_last_refresh.read().await;
        let needs_refresh = match last_refresh {
            None => true,
            Some(t) => (Utc::now() - t).num_seconds() > pool_tool.status_summary.refresh_rate,
        };
        if !needs_refresh {
            return;
        }

        match self.client.get(&pool_tool.status_summary.url).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) => *self.status_summary.write().await = Some(body),
                Err(e) => error!("failed to parse status summary response: {}", e),
            },
            Err(e) => error!("failed to fetch status summary: {}", e),
        }

        *self.status_last_refresh.write().await = Some(Utc::now());
    }

    pub async fn get_max_tip(&self) -> u64 {
        self.status_summary
            .read()
            .await
            .as_ref()
            .and_then(|v| v.get("majoritymax"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    pub async fn send_slots(&self, packager: &SlotPackager<'_>, current_epoch: i64, logs: &[crate::node_client::LeaderLogEntry]) {
        if let Err(e) = packager.process(current_epoch, logs).await {
            error!("failed to publish slot assignment: {}", e);
        }
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_data_slices_block_header_byte_exact() {
        let publisher = TelemetryPublisher::new();
        let stats = NodeStats {
            last_block_height: 42,
            last_block_hash: "deadbeef".to_string(),
            last_block_date: "7.100".to_string(),
            uptime_sec: 10,
            version: "0.13.0".to_string(),
        };

        let mut hex = String::new();
        for i in 0..240 {
            hex.push_str(&format!("{:x}", i % 16));
        }

        publisher.refresh_data_for_tip_update(&stats, &hex, "pool1", "genesisHash", "user1").await;

        let record = publisher.tip_data.read().await.clone().unwrap();
        assert_eq!(record.lastpool, hex[168..232].to_string());
        assert_eq!(record.lastparent, hex[104..168].to_string());
        assert_eq!(record.lastslot, i64::from_str_radix(&hex[24..32], 16).unwrap());
        assert_eq!(record.lastepoch, i64::from_str_radix(&hex[16..24], 16).unwrap());
    }

    #[tokio::test]
    async fn refresh_data_skips_too_short_header() {
        let publisher = TelemetryPublisher::new();
        let stats = NodeStats {
            last_block_height: 1,
            last_block_hash: "a".to_string(),
            last_block_date: "1.1".to_string(),
            uptime_sec: 1,
            version: "v".to_string(),
        };
        publisher.refresh_data_for_tip_update(&stats, "short", "pool1", "genesis", "user1").await;
        assert!(publisher.tip_data.read().await.is_none());
    }

    #[tokio::test]
    async fn max_tip_defaults_to_zero_before_first_fetch() {
        let publisher = TelemetryPublisher::new();
        assert_eq!(publisher.get_max_tip().await, 0);
    }
}
