//! Overlay resolution: turns an [`OverlayConfig`](crate::config::OverlayConfig)
//! plus a current node id into a concrete dial/listen [`Topology`].
//!
//! Grounded in the teacher's `NodeConfig.addrs` shape — a flat map of
//! every participant's address, from which each `Node` works out who it
//! needs to talk to — generalized here into the distilled spec's §4.6
//! role/derived-set/client-server-split rules.

use std::collections::HashSet;

use either::Either;

use crate::config::{NodeSpec, OverlayConfig};
use crate::error::{Error, ErrorKind, Result};

/// A node's role within the overlay.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    Data,
    Compute,
    Result,
    Invalid,
}

/// Works out `id`'s role using the distilled spec's derived sets:
/// `pureData = DATA_NODES \ COMPUTATION_NODES`,
/// `pureResult = RESULT_NODES \ (COMPUTATION_NODES ∪ DATA_NODES)`,
/// and picks the first hit in order `pureData, compute, pureResult`.
pub fn role_of(id: &str, cfg: &OverlayConfig) -> Role {
    let in_compute = cfg.computation_nodes.contains_key(id);
    let in_data = cfg.data_nodes.contains(id);
    let in_result = cfg.result_nodes.contains(id);

    let pure_data = in_data && !in_compute;
    let pure_result = in_result && !in_compute && !in_data;

    if pure_data {
        Role::Data
    } else if in_compute {
        Role::Compute
    } else if pure_result {
        Role::Result
    } else {
        Role::Invalid
    }
}

/// A peer the current node must exchange messages with, reached by
/// dialing it.
pub type ServerInfo = NodeSpec;
/// A peer the current node must exchange messages with, reached by
/// listening for its connection.
pub type ClientInfo = NodeSpec;

/// Resolves which side of a pair between `a` and `b` dials, and which
/// listens, per the distilled spec's §4.6 rule: "B becomes a `serverInfo`
/// of A (A dials B) iff `A.port <= 0` OR (`B.port > 0` AND `A.id < B.id`
/// lexicographically). Otherwise B is a `clientInfo`." This is symmetric
/// in the sense that exactly one side of any valid pair dials.
pub fn a_dials_b(a: &NodeSpec, b: &NodeSpec) -> bool {
    a.is_portless() || (b.port > 0 && a.id < b.id)
}

/// The fully resolved topology for one node: who it dials (`server_infos`)
/// and who it listens for (`client_infos`), plus the connect parameters
/// copied in from the overlay document.
pub struct Topology {
    pub current_node: NodeSpec,
    pub role: Role,
    pub client_infos: Vec<ClientInfo>,
    pub server_infos: Vec<ServerInfo>,
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
}

impl Topology {
    /// Builds the topology for `current_id` out of the overlay document.
    /// Fails with `ErrorKind::Config` if `current_id` isn't in
    /// `NODE_INFO`, or if its role resolves to `Role::Invalid`.
    pub fn build(current_id: &str, cfg: &OverlayConfig) -> Result<Self> {
        let current_node = cfg
            .node(current_id)
            .cloned()
            .ok_or_else(|| Error::simple(ErrorKind::Config))?;

        let role = role_of(current_id, cfg);
        if role == Role::Invalid {
            return Err(Error::simple(ErrorKind::Config));
        }

        let peers = peer_set_for(current_id, role, cfg);

        let mut client_infos = Vec::new();
        let mut server_infos = Vec::new();
        for peer in peers {
            match classify(&current_node, &peer) {
                Either::Left(server_info) => server_infos.push(server_info),
                Either::Right(client_info) => client_infos.push(client_info),
            }
        }

        Ok(Topology {
            current_node,
            role,
            client_infos,
            server_infos,
            connect_timeout_ms: cfg.connect_timeout_ms,
            connect_retries: cfg.connect_retries,
        })
    }

    /// Every peer this node is expected to exchange messages with,
    /// regardless of which side dials.
    pub fn all_peers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.client_infos.iter().chain(self.server_infos.iter())
    }
}

fn classify(current: &NodeSpec, peer: &NodeSpec) -> Either<ServerInfo, ClientInfo> {
    if a_dials_b(current, peer) {
        Either::Left(peer.clone())
    } else {
        Either::Right(peer.clone())
    }
}

/// Role-specific peer lists from the distilled spec's §4.6:
/// data ↔ compute, compute ↔ {data, other compute, result}, result ↔ compute.
fn peer_set_for(current_id: &str, role: Role, cfg: &OverlayConfig) -> Vec<NodeSpec> {
    let compute_ids: HashSet<&str> = cfg.computation_nodes.keys().map(String::as_str).collect();

    let wanted: Box<dyn Fn(&NodeSpec) -> bool> = match role {
        Role::Data => Box::new(move |n: &NodeSpec| compute_ids.contains(n.id.as_str())),
        Role::Result => Box::new(move |n: &NodeSpec| compute_ids.contains(n.id.as_str())),
        Role::Compute => {
            let data_ids: HashSet<String> = cfg.data_nodes.clone();
            let result_ids: HashSet<String> = cfg.result_nodes.clone();
            Box::new(move |n: &NodeSpec| {
                data_ids.contains(&n.id)
                    || result_ids.contains(&n.id)
                    || (compute_ids.contains(n.id.as_str()) && n.id != current_id)
            })
        }
        Role::Invalid => Box::new(|_: &NodeSpec| false),
    };

    cfg.nodes
        .iter()
        .filter(|n| n.id != current_id)
        .filter(|n| wanted(n))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;

    fn role_split_json() -> &'static str {
        r#"{
            "NODE_INFO": [
                {"NODE_ID": "A", "HOST": "127.0.0.1", "PORT": 9001},
                {"NODE_ID": "B", "HOST": "127.0.0.1", "PORT": 9002},
                {"NODE_ID": "C", "HOST": "127.0.0.1", "PORT": 9003},
                {"NODE_ID": "D", "HOST": "127.0.0.1", "PORT": 9004}
            ],
            "DATA_NODES": ["A"],
            "COMPUTATION_NODES": {"B": 0, "C": 1},
            "RESULT_NODES": ["D"]
        }"#
    }

    #[test]
    fn roles_resolve_per_derived_sets() {
        let cfg = OverlayConfig::parse(role_split_json()).unwrap();
        assert_eq!(role_of("A", &cfg), Role::Data);
        assert_eq!(role_of("B", &cfg), Role::Compute);
        assert_eq!(role_of("C", &cfg), Role::Compute);
        assert_eq!(role_of("D", &cfg), Role::Result);
        assert_eq!(role_of("Z", &cfg), Role::Invalid);
    }

    #[test]
    fn data_node_in_computation_nodes_is_not_pure_data() {
        let json = r#"{
            "NODE_INFO": [{"NODE_ID": "A", "HOST": "h", "PORT": 1}],
            "DATA_NODES": ["A"],
            "COMPUTATION_NODES": {"A": 0}
        }"#;
        let cfg = OverlayConfig::parse(json).unwrap();
        assert_eq!(role_of("A", &cfg), Role::Compute);
    }

    #[test]
    fn compute_node_peer_set_is_data_plus_other_compute_plus_result() {
        let cfg = OverlayConfig::parse(role_split_json()).unwrap();
        let topo = Topology::build("B", &cfg).unwrap();
        let peer_ids: HashSet<&str> = topo.all_peers().map(|n| n.id.as_str()).collect();
        assert_eq!(peer_ids, HashSet::from(["A", "C", "D"]));
        assert_eq!(topo.client_infos.len() + topo.server_infos.len(), 3);
    }

    #[test]
    fn lexicographic_split_has_exactly_one_dialer_per_pair() {
        let cfg = OverlayConfig::parse(role_split_json()).unwrap();
        for a_id in ["A", "B", "C", "D"] {
            let a = cfg.node(a_id).unwrap();
            for b_id in ["A", "B", "C", "D"] {
                if a_id == b_id {
                    continue;
                }
                let b = cfg.node(b_id).unwrap();
                // exactly one direction dials
                assert_ne!(a_dials_b(a, b), a_dials_b(b, a));
            }
        }
    }

    #[test]
    fn portless_node_always_dials() {
        let json = r#"{"NODE_INFO": [
            {"NODE_ID": "Z", "HOST": "h", "PORT": 0},
            {"NODE_ID": "A", "HOST": "h", "PORT": 1}
        ]}"#;
        let cfg = OverlayConfig::parse(json).unwrap();
        let z = cfg.node("Z").unwrap();
        let a = cfg.node("A").unwrap();
        assert!(a_dials_b(z, a));
    }

    #[test]
    fn unknown_current_node_is_a_config_error() {
        let cfg = OverlayConfig::parse(role_split_json()).unwrap();
        assert!(Topology::build("nope", &cfg).is_err());
    }
}
