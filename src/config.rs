//! Overlay configuration parsing.
//!
//! Consumes the JSON document described in the distilled spec's §4.6/§6
//! and produces the node catalog + role assignments that
//! [`crate::topology`] resolves into dial/listen lists. Grounded in the
//! teacher's `NodeConfig.addrs: HashMap<NodeId, (SocketAddr, String)>`
//! shape and in `original_source/example/check_config_json.cpp`'s JSON
//! key usage, implemented with `serde` + `serde_json` instead of a
//! hand-rolled parser (a crate used by three of the five retrieval-pack
//! repos).

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::{Error, ErrorKind, Result};

/// One entry of the overlay's `NODE_INFO` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeSpec {
    /// `true` when this node has no listening port of its own, and must
    /// therefore always dial out (distilled spec §4.6: "A.port ≤ 0").
    pub fn is_portless(&self) -> bool {
        self.port == 0
    }
}

#[derive(Debug, Deserialize)]
struct RawNodeInfo {
    #[serde(rename = "NODE_ID")]
    node_id: String,
    #[serde(rename = "NAME", default)]
    name: String,
    #[serde(rename = "HOST")]
    host: String,
    #[serde(rename = "PORT")]
    port: i64,
}

#[derive(Debug, Deserialize, Default)]
struct RawConnectParams {
    #[serde(rename = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(rename = "RETRIES")]
    retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawOverlayConfig {
    #[serde(rename = "NODE_INFO")]
    node_info: Vec<RawNodeInfo>,
    #[serde(rename = "DATA_NODES", default)]
    data_nodes: Vec<String>,
    #[serde(rename = "COMPUTATION_NODES", default)]
    computation_nodes: HashMap<String, i32>,
    #[serde(rename = "RESULT_NODES", default)]
    result_nodes: Vec<String>,
    #[serde(rename = "CONNECT_PARAMS", default)]
    connect_params: RawConnectParams,
}

/// `RETRIES` is defaulted to this value when absent from the document,
/// per the distilled spec's §6 ("RETRIES >= 1 or defaulted to 5").
pub const DEFAULT_RETRIES: u32 = 5;

/// The fully parsed overlay configuration.
pub struct OverlayConfig {
    pub nodes: Vec<NodeSpec>,
    pub data_nodes: HashSet<String>,
    pub computation_nodes: HashMap<String, i32>,
    pub result_nodes: HashSet<String>,
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
}

impl OverlayConfig {
    /// Parses the overlay JSON document described in the distilled
    /// spec's §4.6/§6. `NODE_INFO` is mandatory; `DATA_NODES`,
    /// `COMPUTATION_NODES`, `RESULT_NODES` default to empty when
    /// missing, and `CONNECT_PARAMS.TIMEOUT` (given in seconds in the
    /// document) is converted to milliseconds here.
    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawOverlayConfig = serde_json::from_str(json)
            .wrapped_msg(ErrorKind::Config, "overlay configuration is not valid JSON")?;

        if raw.node_info.is_empty() {
            return Err(Error::simple(ErrorKind::Config))
                .wrapped_msg(ErrorKind::Config, "NODE_INFO is missing or empty");
        }

        let mut nodes = Vec::with_capacity(raw.node_info.len());
        let mut seen = HashSet::new();
        for n in raw.node_info {
            if n.port < 0 || n.port > u16::MAX as i64 {
                return Err(Error::simple(ErrorKind::Config)).wrapped_msg(
                    ErrorKind::Config,
                    &format!("node {} has an out-of-range PORT", n.node_id),
                );
            }
            if !seen.insert(n.node_id.clone()) {
                return Err(Error::simple(ErrorKind::Config)).wrapped_msg(
                    ErrorKind::Config,
                    &format!("duplicate NODE_ID {}", n.node_id),
                );
            }
            nodes.push(NodeSpec {
                id: n.node_id,
                name: n.name,
                host: n.host,
                port: n.port as u16,
            });
        }

        let retries = match raw.connect_params.retries {
            Some(r) if r >= 1 => r,
            _ => DEFAULT_RETRIES,
        };
        let connect_timeout_ms = raw.connect_params.timeout.unwrap_or(0).saturating_mul(1000);

        Ok(OverlayConfig {
            nodes,
            data_nodes: raw.data_nodes.into_iter().collect(),
            computation_nodes: raw.computation_nodes,
            result_nodes: raw.result_nodes.into_iter().collect(),
            connect_timeout_ms,
            connect_retries: retries,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

use crate::error::ResultWrappedExt;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "NODE_INFO": [
                {"NODE_ID": "A", "NAME": "node-a", "HOST": "127.0.0.1", "PORT": 9001},
                {"NODE_ID": "B", "NAME": "node-b", "HOST": "127.0.0.1", "PORT": 9002},
                {"NODE_ID": "C", "NAME": "node-c", "HOST": "127.0.0.1", "PORT": 9003},
                {"NODE_ID": "D", "NAME": "node-d", "HOST": "127.0.0.1", "PORT": 9004}
            ],
            "DATA_NODES": ["A"],
            "COMPUTATION_NODES": {"B": 0, "C": 1},
            "RESULT_NODES": ["D"],
            "CONNECT_PARAMS": {"TIMEOUT": 5, "RETRIES": 3}
        }"#
    }

    #[test]
    fn parses_full_document() {
        let cfg = OverlayConfig::parse(sample_json()).unwrap();
        assert_eq!(cfg.nodes.len(), 4);
        assert_eq!(cfg.connect_timeout_ms, 5000);
        assert_eq!(cfg.connect_retries, 3);
        assert!(cfg.data_nodes.contains("A"));
        assert_eq!(cfg.computation_nodes.get("B"), Some(&0));
    }

    #[test]
    fn missing_node_info_is_fatal() {
        let err = OverlayConfig::parse(r#"{"NODE_INFO": []}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn missing_optional_sections_default_empty() {
        let json = r#"{"NODE_INFO": [{"NODE_ID": "A", "HOST": "h", "PORT": 1}]}"#;
        let cfg = OverlayConfig::parse(json).unwrap();
        assert!(cfg.data_nodes.is_empty());
        assert!(cfg.computation_nodes.is_empty());
        assert!(cfg.result_nodes.is_empty());
        assert_eq!(cfg.connect_retries, DEFAULT_RETRIES);
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let json = r#"{"NODE_INFO": [
            {"NODE_ID": "A", "HOST": "h", "PORT": 1},
            {"NODE_ID": "A", "HOST": "h2", "PORT": 2}
        ]}"#;
        assert!(OverlayConfig::parse(json).is_err());
    }

    #[test]
    fn zero_retries_falls_back_to_default() {
        let json = r#"{"NODE_INFO": [{"NODE_ID": "A", "HOST": "h", "PORT": 1}],
                        "CONNECT_PARAMS": {"RETRIES": 0}}"#;
        let cfg = OverlayConfig::parse(json).unwrap();
        assert_eq!(cfg.connect_retries, DEFAULT_RETRIES);
    }
}
