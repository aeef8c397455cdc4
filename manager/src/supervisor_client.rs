// File: manager/src/supervisor_client.rs
//! Thin facade over the process supervisor's remote XML-RPC API.
//! State-code mapping is kept in exactly one place, per design note §9.

use crate::errors::SupervisorError;
use crate::xmlrpc::{self, Param, XmlRpcValue};
use anyhow::Result;
use reqwest::Client;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unknown,
    Started,
    Bootstrapping,
    Stopped,
}

impl SupervisorState {
    /// The external supervisor's opaque state codes, mapped per spec §4.2.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 | 40 => SupervisorState::Stopped,
            10 => SupervisorState::Bootstrapping,
            20 => SupervisorState::Started,
            _ => SupervisorState::Unknown,
        }
    }

    pub fn is_up(self) -> bool {
        matches!(self, SupervisorState::Started | SupervisorState::Bootstrapping)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub state: SupervisorState,
    pub start_epoch: i64,
    pub now_epoch: i64,
}

impl ProcessInfo {
    pub fn uptime_sec(&self) -> i64 {
        self.now_epoch - self.start_epoch
    }
}

pub struct SupervisorClient {
    rpc_url: String,
    client: Client,
}

impl SupervisorClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            client: Client::new(),
        }
    }

    pub async fn get_info(&self, service: &str) -> Result<ProcessInfo, SupervisorError> {
        let value = self.call("supervisor.getProcessInfo", &[Param::Str(service.to_string())]).await?;
        let fields = value.as_struct().ok_or_else(|| SupervisorError::MalformedResponse {
            service: service.to_string(),
            reason: "expected a struct response".to_string(),
        })?;

        let state_code = fields
            .get("state")
            .and_then(XmlRpcValue::as_int)
            .ok_or_else(|| SupervisorError::MalformedResponse {
                service: service.to_string(),
                reason: "missing 'state' field".to_string(),
            })?;
        let start_epoch = fields.get("start").and_then(XmlRpcValue::as_int).unwrap_or(0);
        let now_epoch = fields.get("now").and_then(XmlRpcValue::as_int).unwrap_or(0);

        Ok(ProcessInfo {
            state: SupervisorState::from_code(state_code),
            start_epoch,
            now_epoch,
        })
    }

    pub async fn is_up(&self, service: &str) -> Result<bool, SupervisorError> {
        Ok(self.get_info(service).await?.state.is_up())
    }

    pub async fn start(&self, service: &str) -> Result<(), SupervisorError> {
        let value = self.call("supervisor.startProcess", &[Param::Str(service.to_string())]).await?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(SupervisorError::ActionFailed {
                service: service.to_string(),
                action: "start".to_string(),
            })
        }
    }

    pub async fn stop(&self, service: &str) -> Result<(), SupervisorError> {
        let value = self.call("supervisor.stopProcess", &[Param::Str(service.to_string())]).await?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(SupervisorError::ActionFailed {
                service: service.to_string(),
                action: "stop".to_string(),
            })
        }
    }

    async fn call(&self, method: &str, params: &[Param]) -> Result<XmlRpcValue, SupervisorError> {
        let body = xmlrpc::build_request(method, params);
        debug!("supervisor RPC -> {} {:?}", method, params);

        let response = self
            .client
            .post(&self.rpc_url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| SupervisorError::Transport {
                service: method.to_string(),
                reason: e.to_string(),
            })?;

        let text = response.text().await.map_err(|e| SupervisorError::Transport {
            service: method.to_string(),
            reason: e.to_string(),
        })?;

        xmlrpc::parse_response(&text).map_err(|e| SupervisorError::MalformedResponse {
            service: method.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_code_mapping() {
        assert_eq!(SupervisorState::from_code(0), SupervisorState::Stopped);
        assert_eq!(SupervisorState::from_code(40), SupervisorState::Stopped);
        assert_eq!(SupervisorState::from_code(10), SupervisorState::Bootstrapping);
        assert_eq!(SupervisorState::from_code(20), SupervisorState::Started);
        assert_eq!(SupervisorState::from_code(99), SupervisorState::Unknown);
    }

    #[test]
    fn is_up_covers_started_and_bootstrapping_only() {
        assert!(SupervisorState::Started.is_up());
        assert!(SupervisorState::Bootstrapping.is_up());
        assert!(!SupervisorState::Stopped.is_up());
        assert!(!SupervisorState::Unknown.is_up());
    }

    #[test]
    fn uptime_is_now_minus_start() {
        let info = ProcessInfo {
            state: SupervisorState::Started,
            start_epoch: 100,
            now_epoch: 142,
        };
        assert_eq!(info.uptime_sec(), 42);
    }
}
