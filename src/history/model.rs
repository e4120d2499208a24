// src/history/model.rs

//! Persisted per-run status.
//!
//! Timestamps serialize as RFC 3339 UTC; an empty time is `"-"` so the
//! JSON stays greppable and the round trip is lossless.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::graph::node::{Node, NodeData, NodeState};
use crate::graph::scheduler::RunStatus;

/// Snapshot of one run, written after every node completion and at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub request_id: String,
    pub name: String,
    pub status: RunStatus,
    pub status_text: String,
    pub pid: Option<u32>,
    pub started_at: String,
    pub finished_at: String,
    /// Path of the agent log file.
    pub log: String,
    pub params: Vec<String>,
    pub nodes: Vec<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_cancel: Option<NodeStatus>,
}

impl Status {
    pub fn to_json(&self) -> crate::errors::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> crate::errors::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Snapshot of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub state: NodeState,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub done_count: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl NodeStatus {
    pub fn from_node(node: &Node) -> Self {
        let data = node.data();
        Self::from_parts(node.name(), &data)
    }

    pub fn from_parts(name: &str, data: &NodeData) -> Self {
        Self {
            name: name.to_string(),
            state: data.state,
            started_at: format_time(data.started_at),
            finished_at: format_time(data.finished_at),
            error: data.error.clone(),
            retry_count: data.retry_count,
            done_count: data.done_count,
            outputs: data.outputs.clone(),
            log: data
                .log_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }

    /// Reconstruct node data from a persisted snapshot (retry seeding).
    pub fn to_node_data(&self) -> NodeData {
        NodeData {
            state: self.state,
            attempts: 0,
            retry_count: self.retry_count,
            done_count: self.done_count,
            started_at: parse_time(&self.started_at),
            finished_at: parse_time(&self.finished_at),
            error: self.error.clone(),
            outputs: self.outputs.clone(),
            log_file: self.log.as_ref().map(Into::into),
            pid: None,
        }
    }
}

/// RFC 3339 UTC, or `"-"` for an unset time.
pub fn format_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => "-".to_string(),
    }
}

/// Inverse of [`format_time`]; anything unparsable reads as unset.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() || s == "-" {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_time_round_trips_as_dash() {
        assert_eq!(format_time(None), "-");
        assert_eq!(parse_time("-"), None);
        assert_eq!(parse_time(""), None);
    }

    #[test]
    fn times_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(parse_time(&format_time(Some(t))), Some(t));
    }

    #[test]
    fn status_json_round_trips() {
        let status = Status {
            request_id: "req-1".to_string(),
            name: "demo".to_string(),
            status: RunStatus::Success,
            status_text: RunStatus::Success.to_string(),
            pid: Some(42),
            started_at: format_time(Some(Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap())),
            finished_at: "-".to_string(),
            log: "/tmp/agent.log".to_string(),
            params: vec!["one".to_string()],
            nodes: vec![NodeStatus {
                name: "a".to_string(),
                state: NodeState::Success,
                started_at: "-".to_string(),
                finished_at: "-".to_string(),
                error: None,
                retry_count: 1,
                done_count: 1,
                outputs: HashMap::from([("OUT".to_string(), "1".to_string())]),
                log: None,
            }],
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        };

        let reloaded = Status::from_json(&status.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, status);
    }

    #[test]
    fn json_uses_camel_case_fields() {
        let status = Status {
            request_id: "r".to_string(),
            name: "d".to_string(),
            status: RunStatus::Running,
            status_text: RunStatus::Running.to_string(),
            pid: None,
            started_at: "-".to_string(),
            finished_at: "-".to_string(),
            log: String::new(),
            params: Vec::new(),
            nodes: Vec::new(),
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        };
        let json = status.to_json().unwrap();
        assert!(json.contains("\"requestId\""));
        assert!(json.contains("\"statusText\""));
        assert!(json.contains("\"startedAt\""));
    }
}
