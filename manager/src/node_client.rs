// File: manager/src/node_client.rs
//! Encapsulates all interactions with one node's CLI/REST surface.
//!
//! Every CLI invocation is serialized by a single fleet-wide mutex (§5):
//! the external CLI and REST endpoints share backend resources that
//! misbehave under concurrent access, so every `NodeClient` in the fleet
//! is constructed with a clone of the same `CliMutex`.

use crate::errors::CliError;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// The single process-wide lock guarding every node-CLI invocation.
pub type CliMutex = Arc<Mutex<()>>;

pub fn new_cli_mutex() -> CliMutex {
    Arc::new(Mutex::new(()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub last_block_height: u64,
    pub last_block_hash: String,
    pub last_block_date: String,
    pub uptime_sec: i64,
    pub version: String,
}

impl NodeStats {
    /// Integer epoch prefix of `last_block_date` ("<epoch>.<slot>").
    pub fn epoch(&self) -> i64 {
        self.last_block_date
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLogEntry {
    pub scheduled_at_date: String,
    pub scheduled_at_time: String,
    pub finished_at_time: Option<String>,
}

/// Outcome of a single `get_stats` poll, per §4.3.
#[derive(Debug, Clone)]
pub enum StatsOutcome {
    Bootstrapping,
    Stats(NodeStats),
    NotReady,
}

pub struct NodeClient {
    cli_tool_path: String,
    rest_host: String,
    cli_mutex: CliMutex,
}

impl NodeClient {
    pub fn new(cli_tool_path: impl Into<String>, rest_host: impl Into<String>, cli_mutex: CliMutex) -> Self {
        Self {
            cli_tool_path: cli_tool_path.into(),
            rest_host: rest_host.into(),
            cli_mutex,
        }
    }

    pub async fn get_stats(&self) -> Result<StatsOutcome, CliError> {
        let _guard = self.cli_mutex.lock().await;
        let output = self
            .run(&["rest", "v0", "node", "stats", "get", "-h", &self.rest_host, "--output-format", "json"])
            .await?;

        let value: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            CliError::classify(
                format!("failed to parse node stats: {}", e),
                output.status,
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            )
        })?;

        if value.get("state").and_then(|v| v.as_str()) == Some("Bootstrapping") {
            return Ok(StatsOutcome::Bootstrapping);
        }

        let Some(height) = value.get("lastBlockHeight").and_then(|v| v.as_u64()) else {
            return Ok(StatsOutcome::NotReady);
        };

        let stats = NodeStats {
            last_block_height: height,
            last_block_hash: value
                .get("lastBlockHash")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            last_block_date: value
                .get("lastBlockDate")
                .and_then(|v| v.as_str())
                .unwrap_or("0.0")
                .to_string(),
            uptime_sec: value.get("uptime").and_then(|v| v.as_i64()).unwrap_or(-1),
            version: value.get("version").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        };

        Ok(StatsOutcome::Stats(stats))
    }

    /// Fetches currently registered leader ids. Returns `None` without
    /// touching the CLI if the fleet-wide mutex is already held
    /// elsewhere, so callers fall back to a cached value (§5).
    pub async fn try_get_leaders(&self) -> Result<Option<Vec<i64>>, CliError> {
        let Ok(_guard) = self.cli_mutex.try_lock() else {
            return Ok(None);
        };

        let output = self
            .run(&["rest", "v0", "leaders", "get", "-h", &self.rest_host, "--output-format", "json"])
            .await?;

        let ids: Vec<i64> = serde_json::from_slice(&output.stdout).map_err(|e| {
            CliError::classify(
                format!("failed to parse leaders list: {}", e),
                output.status,
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            )
        })?;

        Ok(Some(ids))
    }

    pub async fn register_leader(&self, secret_file: &str) -> Result<i64, CliError> {
        let _guard = self.cli_mutex.lock().await;
        self.run(&["rest", "v0", "leaders", "post", "-f", secret_file, "-h", &self.rest_host, "--output-format", "json"])
            .await?;
        drop(_guard);

        // Verify post-condition by re-listing leaders (§4.3).
        let ids = loop {
            if let Some(ids) = self.try_get_leaders().await? {
                break ids;
            }
        };

        ids.last().copied().ok_or_else(|| {
            CliError::classify("register_leader succeeded but no leader id was found", 0, String::new(), String::new())
        })
    }

    pub async fn unregister_leader(&self, leader_id: i64) -> Result<(), CliError> {
        let _guard = self.cli_mutex.lock().await;
        let output = self
            .run(&["rest", "v0", "leaders", "delete", &leader_id.to_string(), "-h", &self.rest_host])
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !stdout.to_lowercase().contains("success") {
            return Err(CliError::classify(
                "unregister_leader did not report success",
                output.status,
                stdout,
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }

    pub async fn get_leaders_logs(&self) -> Result<Vec<LeaderLogEntry>, CliError> {
        let _guard = self.cli_mutex.lock().await;
        let output = self
            .run(&["rest", "v0", "leaders", "logs", "get", "-h", &self.rest_host, "--output-format", "json"])
            .await?;

        serde_json::from_slice(&output.stdout).map_err(|e| {
            CliError::classify(
                format!("failed to parse leader logs: {}", e),
                output.status,
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            )
        })
    }

    pub async fn get_block(&self, hash: &str) -> Result<String, CliError> {
        let _guard = self.cli_mutex.lock().await;
        let output = self.run(&["rest", "v0", "block", hash, "get", "-h", &self.rest_host]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Atomic overwrite of the per-node config file. Does not touch the
    /// CLI mutex: this is a plain filesystem write, not a node RPC.
    pub async fn write_config(&self, config_file_path: &str, merged_config: &serde_json::Value) -> anyhow::Result<()> {
        let body = serde_json::to_string_pretty(merged_config)?;
        let tmp_path = format!("{}.tmp", config_file_path);
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, config_file_path).await?;
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<RawOutput, CliError> {
        debug!("{} {}", self.cli_tool_path, args.join(" "));
        let output = Command::new(&self.cli_tool_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CliError::classify(format!("failed to spawn {}", self.cli_tool_path), -1, String::new(), e.to_string()))?;

        let status = output.status.code().unwrap_or(-1);
        if status != 0 {
            return Err(CliError::classify(
                format!("{} exited with status {}", self.cli_tool_path, status),
                status,
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(RawOutput {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

struct RawOutput {
    status: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}
