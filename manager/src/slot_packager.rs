// File: manager/src/slot_packager.rs
//! Builds the per-epoch slot-assignment payload sent to the aggregator,
//! in one of three mutually exclusive verification modes selected by
//! config flags. Grounded in `original_source/jmanager/slots.py`.

use crate::config::SendSlotsConfig;
use crate::node_client::LeaderLogEntry;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

pub struct SlotPackager<'a> {
    config: &'a SendSlotsConfig,
    client: Client,
    pool_id: String,
    genesis_hash: String,
    user_id: String,
}

impl<'a> SlotPackager<'a> {
    pub fn new(config: &'a SendSlotsConfig, pool_id: String, genesis_hash: String, user_id: String) -> Self {
        Self {
            config,
            client: Client::new(),
            pool_id,
            genesis_hash,
            user_id,
        }
    }

    /// Filters a leader-log to the entries scheduled for `current_epoch`
    /// (the `scheduled_at_date` string prefix before the first `.`).
    pub fn current_epoch_slots(current_epoch: i64, logs: &[LeaderLogEntry]) -> Vec<LeaderLogEntry> {
        let epoch_str = current_epoch.to_string();
        logs.iter()
            .filter(|s| s.scheduled_at_date.split('.').next() == Some(epoch_str.as_str()))
            .cloned()
            .collect()
    }

    pub async fn process(&self, current_epoch: i64, logs: &[LeaderLogEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.key_path)
            .await
            .with_context(|| format!("creating key_path directory {}", self.config.key_path))?;

        let current_slots = Self::current_epoch_slots(current_epoch, logs);
        let previous_epoch = current_epoch - 1;

        if self.config.verify_slots_gpg {
            self.verify_slots_gpg(current_epoch, previous_epoch, &current_slots).await
        } else if self.config.verify_slots_hash {
            self.verify_slots_hash(current_epoch, previous_epoch, &current_slots).await
        } else {
            self.no_verification(current_epoch, &current_slots).await
        }
    }

    async fn verify_slots_gpg(&self, current_epoch: i64, previous_epoch: i64, current_slots: &[LeaderLogEntry]) -> Result<()> {
        let previous_key_path = format!("{}/passphrase_{}", self.config.key_path, previous_epoch);
        let previous_epoch_key = if Path::new(&previous_key_path).exists() {
            tokio::fs::read_to_string(&previous_key_path).await?
        } else {
            String::new()
        };

        let current_key_path = format!("{}/passphrase_{}", self.config.key_path, current_epoch);
        let current_epoch_key = if Path::new(&current_key_path).exists() {
            tokio::fs::read_to_string(&current_key_path).await?
        } else {
            let key = generate_passphrase().await?;
            tokio::fs::write(&current_key_path, &key).await?;
            key
        };

        let encrypted = encrypt_slots(current_slots, &current_epoch_key).await?;

        let payload = json!({
            "currentepoch": current_epoch.to_string(),
            "poolid": self.pool_id,
            "genesispref": genesis_prefix(&self.genesis_hash),
            "userid": self.user_id,
            "assigned_slots": current_slots.len().to_string(),
            "previous_epoch_key": previous_epoch_key,
            "encrypted_slots": encrypted,
        });

        self.send(&payload).await
    }

    async fn verify_slots_hash(&self, current_epoch: i64, previous_epoch: i64, current_slots: &[LeaderLogEntry]) -> Result<()> {
        let previous_path = format!("{}/leader_slots_{}", self.config.key_path, previous_epoch);
        let last_epoch_slots = if Path::new(&previous_path).exists() {
            tokio::fs::read_to_string(&previous_path).await?
        } else {
            String::new()
        };

        let current_path = format!("{}/leader_slots_{}", self.config.key_path, current_epoch);
        let current_slots_json = serde_json::to_string(current_slots)?;
        if !Path::new(&current_path).exists() {
            tokio::fs::write(&current_path, &current_slots_json).await?;
        }

        let mut hasher = Sha256::new();
        hasher.update(current_slots_json.as_bytes());
        let current_epoch_hash = hex::encode(hasher.finalize());

        let hash_path = format!("{}/hash_{}", self.config.key_path, current_epoch);
        tokio::fs::write(&hash_path, &current_epoch_hash).await?;

        let payload = json!({
            "currentepoch": current_epoch.to_string(),
            "poolid": self.pool_id,
            "genesispref": genesis_prefix(&self.genesis_hash),
            "userid": self.user_id,
            "assigned_slots": current_slots.len().to_string(),
            "this_epoch_hash": current_epoch_hash,
            "last_epoch_slots": last_epoch_slots,
        });

        self.send(&payload).await
    }

    async fn no_verification(&self, current_epoch: i64, current_slots: &[LeaderLogEntry]) -> Result<()> {
        let payload = json!({
            "currentepoch": current_epoch.to_string(),
            "poolid": self.pool_id,
            "genesispref": genesis_prefix(&self.genesis_hash),
            "userid": self.user_id,
            "assigned_slots": current_slots.len().to_string(),
        });

        self.send(&payload).await
    }

    async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        debug!("sending slot assignment payload: {}", payload);
        let response = self.client.post(&self.config.url).json(payload).send().await;
        match response {
            Ok(resp) => debug!("slot assignment response: {}", resp.status()),
            Err(e) => error!("failed to send slot assignment payload: {}", e),
        }
        Ok(())
    }
}

fn genesis_prefix(genesis_hash: &str) -> String {
    genesis_hash.chars().take(7).collect()
}

/// Shells out to the system RNG, matching the original's key-generation
/// path rather than reimplementing it with an in-process crate.
async fn generate_passphrase() -> Result<String> {
    let output = Command::new("openssl")
        .args(["rand", "-base64", "32"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("spawning openssl rand")?;

    if !output.status.success() {
        anyhow::bail!("openssl rand exited with {:?}", output.status.code());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Shells out to `gpg --symmetric` over the JSON-encoded slot list,
/// matching the original's external-tool invocation.
async fn encrypt_slots(slots: &[LeaderLogEntry], passphrase: &str) -> Result<String> {
    let body = if slots.is_empty() {
        "[]".to_string()
    } else {
        serde_json::to_string(slots)?
    };

    let mut child = Command::new("gpg")
        .args(["--symmetric", "--armor", "--batch", "--passphrase", passphrase])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning gpg")?;

    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        stdin.write_all(body.as_bytes()).await?;
    }

    let output = child.wait_with_output().await.context("waiting for gpg")?;
    if !output.status.success() {
        anyhow::bail!("gpg exited with {:?}: {}", output.status.code(), String::from_utf8_lossy(&output.stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(date: &str) -> LeaderLogEntry {
        LeaderLogEntry {
            scheduled_at_date: date.to_string(),
            scheduled_at_time: "2024-01-01T00:00:00Z".to_string(),
            finished_at_time: None,
        }
    }

    #[test]
    fn filters_exactly_current_epoch_entries() {
        let logs = vec![entry("7.100"), entry("7.101"), entry("8.5")];
        let filtered = SlotPackager::current_epoch_slots(7, &logs);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|s| s.scheduled_at_date.starts_with("7.")));
    }

    #[test]
    fn genesis_prefix_is_first_seven_chars() {
        assert_eq!(genesis_prefix("abcdef0123456789"), "abcdef0");
        assert_eq!(genesis_prefix("abc"), "abc");
    }

    #[test]
    fn hex_encode_matches_known_digest() {
        let mut hasher = Sha256::new();
        hasher.update(b"[]");
        let digest = hex::encode(hasher.finalize());
        assert_eq!(digest, "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945");
    }
}
