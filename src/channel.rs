//! `Channel`: the public façade a caller actually uses. One `Channel` per
//! `taskId`, created idempotently (concurrent `create` calls for the same
//! `taskId` converge on one instance), backed by its own
//! [`crate::runtime::Runtime`], [`crate::topology::Topology`],
//! [`crate::client::Client`] and [`crate::server::Server`].
//!
//! Grounded in `original_source/example/check_config_json.cpp`'s
//! `CreateInternalChannel`/`channel->Send`/`channel->Recv`/
//! `DestroyInternalChannel` shape — the process-wide idempotent-by-taskId
//! registry that implies is not something the teacher's `Node` API has
//! (callers construct their own `Node` directly), so it's built here with
//! `once_cell`, the lazy-static crate `gattaca-com-flux` reaches for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::client::Client;
use crate::config::OverlayConfig;
use crate::connection::{CloseReason, Connection, ErrorCallback};
use crate::runtime::Runtime;
use crate::server::Server;
#[cfg(feature = "tls_rustls")]
use crate::socket::TlsConfig;
use crate::topology::{Role, Topology};

/// Errors from the `Channel` public boundary. The distilled spec's
/// §6/§7 describe these as negative return codes (`-1`, `-3`, `-4`, `0`);
/// `0` (clean peer shutdown) is represented as `Ok(0)` from
/// [`Channel::recv`] rather than as a `ChannelError` variant, since it is
/// not a failure from this crate's point of view.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// A generic, non-specific failure (distilled spec's `-1`).
    Generic,
    /// A blocking operation exceeded its deadline (`-3`).
    Timeout,
    /// The peer is not connected, or stopped being connected while this
    /// call was blocked (`-4`).
    Unconnected,
    /// The overlay configuration document was invalid.
    Config,
    /// `peerId` isn't a recognized participant of this channel.
    UnknownPeer,
}

impl From<crate::error::Error> for ChannelError {
    fn from(e: crate::error::Error) -> Self {
        use crate::error::ErrorKind;
        match e.kind() {
            ErrorKind::Timeout => ChannelError::Timeout,
            ErrorKind::Disconnected => ChannelError::Unconnected,
            ErrorKind::Config => ChannelError::Config,
            _ => ChannelError::Generic,
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

struct InFlight {
    result: Mutex<Option<Option<Arc<Channel>>>>,
    cv: Condvar,
}

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<Channel>>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static IN_FLIGHT: Lazy<Mutex<HashMap<String, Arc<InFlight>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// One `Runtime` (and therefore one connection pool) per local `nodeId`,
/// kept alive across `Channel::create`/`destroy` cycles so that task
/// `T2` reusing the same peer pair as a destroyed task `T1` gets the
/// same pooled `Connection` rather than dialing again — the distilled
/// spec's §8 "Reuse across tasks" scenario.
static RUNTIMES: Lazy<Mutex<HashMap<String, Arc<Runtime>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn runtime_for(node_id: &str) -> crate::error::Result<Arc<Runtime>> {
    let mut runtimes = RUNTIMES.lock();
    if let Some(rt) = runtimes.get(node_id) {
        return Ok(Arc::clone(rt));
    }
    let rt = Arc::new(Runtime::new()?);
    runtimes.insert(node_id.to_string(), Arc::clone(&rt));
    Ok(rt)
}

pub struct Channel {
    task_id: String,
    current_node_id: String,
    topology: Topology,
    overlay: OverlayConfig,
    runtime: Arc<Runtime>,
    client: Client,
    server: Server,
    connected_cache: Mutex<Option<Vec<String>>>,
}

impl Channel {
    /// Idempotent per `taskId`: a second `create` call for a `taskId`
    /// already under construction blocks until the first finishes, then
    /// returns the same `Channel` (or the same error, surfaced as
    /// `ChannelError::Generic` to the follower since the original error
    /// value isn't `Clone`-able across the rendezvous).
    pub fn create(
        task_id: &str,
        node_id: &str,
        config_json: &str,
        error_callback: Option<ErrorCallback>,
    ) -> ChannelResult<Arc<Channel>> {
        Self::create_with_tls(
            task_id,
            node_id,
            config_json,
            #[cfg(feature = "tls_rustls")]
            None,
            error_callback,
        )
    }

    /// Same as [`Channel::create`], but lets the caller supply a
    /// [`TlsConfig`] to turn on TLS for both the dialing and the
    /// listening side of this node, per the distilled spec's §6 ("when
    /// enabled globally, both Client and Server use TLS"). Certificate
    /// *loading* stays the caller's job (distilled spec §1 non-goal);
    /// this only takes the already-built `rustls` configs.
    pub fn create_with_tls(
        task_id: &str,
        node_id: &str,
        config_json: &str,
        #[cfg(feature = "tls_rustls")] tls: Option<TlsConfig>,
        error_callback: Option<ErrorCallback>,
    ) -> ChannelResult<Arc<Channel>> {
        if let Some(existing) = REGISTRY.lock().get(task_id).cloned() {
            return Ok(existing);
        }

        let (in_flight, is_leader) = {
            let mut guard = IN_FLIGHT.lock();
            let is_leader = !guard.contains_key(task_id);
            let slot = guard
                .entry(task_id.to_string())
                .or_insert_with(|| {
                    Arc::new(InFlight {
                        result: Mutex::new(None),
                        cv: Condvar::new(),
                    })
                })
                .clone();
            (slot, is_leader)
        };

        if !is_leader {
            let mut result = in_flight.result.lock();
            if result.is_none() {
                in_flight.cv.wait_for(&mut result, Duration::from_secs(60));
            }
            return result
                .clone()
                .flatten()
                .ok_or(ChannelError::Generic);
        }

        let built = Self::build(
            task_id,
            node_id,
            config_json,
            #[cfg(feature = "tls_rustls")]
            tls,
            error_callback,
        );
        if let Err(e) = &built {
            tracing::error!(task_id, node_id, error = %e, "channel creation failed");
        }
        let channel = built.ok();
        if let Some(channel) = &channel {
            REGISTRY.lock().insert(task_id.to_string(), Arc::clone(channel));
        }
        *in_flight.result.lock() = Some(channel.clone());
        in_flight.cv.notify_all();
        IN_FLIGHT.lock().remove(task_id);

        channel.ok_or(ChannelError::Generic)
    }

    fn build(
        task_id: &str,
        node_id: &str,
        config_json: &str,
        #[cfg(feature = "tls_rustls")] tls: Option<TlsConfig>,
        error_callback: Option<ErrorCallback>,
    ) -> crate::error::Result<Arc<Channel>> {
        let overlay = OverlayConfig::parse(config_json)?;
        let topology = Topology::build(node_id, &overlay)?;
        let runtime = runtime_for(node_id)?;

        let client = Client::new(
            Arc::clone(&runtime),
            node_id.to_string(),
            Duration::from_millis(topology.connect_timeout_ms.max(1)),
            topology.connect_retries,
            #[cfg(feature = "tls_rustls")]
            tls.clone(),
            error_callback.clone(),
        );
        let server = Server::new(Arc::clone(&runtime), node_id.to_string());

        if let Some(me) = overlay.node(node_id) {
            if !me.is_portless() {
                let bind_addr = format!("0.0.0.0:{}", me.port)
                    .parse()
                    .map_err(|_| crate::error::Error::simple(crate::error::ErrorKind::Config))?;
                server.listen(
                    bind_addr,
                    error_callback,
                    #[cfg(feature = "tls_rustls")]
                    tls,
                )?;
            }
        }

        for peer in &topology.client_infos {
            server.expect_client(&peer.id);
        }

        let channel = Arc::new(Channel {
            task_id: task_id.to_string(),
            current_node_id: node_id.to_string(),
            topology,
            overlay,
            runtime,
            client,
            server,
            connected_cache: Mutex::new(None),
        });

        channel.start_all_peers()?;
        Ok(channel)
    }

    fn start_all_peers(&self) -> crate::error::Result<()> {
        for peer in &self.topology.server_infos {
            let conn = self.client.connect(peer)?;
            conn.start(&self.task_id)?;
        }
        for peer in &self.topology.client_infos {
            let conn = self
                .server
                .wait_for_client(&peer.id, Duration::from_millis(self.topology.connect_timeout_ms.max(5_000)))?;
            conn.start(&self.task_id)?;
        }
        Ok(())
    }

    /// Sends `payload` tagged with `message_id` to `peer_id`. `message_id`
    /// is the public, textual id described in the distilled spec's
    /// §4.2 — hex pairs by default, converted here to the halved binary
    /// id that actually goes on the wire (or kept as literal bytes under
    /// the `id_literal_text` feature).
    pub fn send(&self, peer_id: &str, message_id: &str, payload: &[u8]) -> ChannelResult<usize> {
        let conn = self.lookup_connection(peer_id)?;
        let wire_id = crate::framing::encode_id(message_id).map_err(ChannelError::from)?;
        conn.send(&wire_id, payload).map_err(ChannelError::from)
    }

    /// Receives into `out[..n]` for `message_id` from `peer_id`. Returns
    /// `Ok(0)` when the connection closed cleanly (peer EOF) while this
    /// call was blocked, per the distilled spec's §6/§9 resolution of
    /// that ambiguity; any other disconnection surfaces as
    /// `ChannelError::Unconnected`.
    pub fn recv(&self, peer_id: &str, message_id: &str, out: &mut [u8], n: usize, timeout: Option<Duration>) -> ChannelResult<usize> {
        let conn = self.lookup_connection(peer_id)?;
        let wire_id = crate::framing::encode_id(message_id).map_err(ChannelError::from)?;
        match conn.recv(&wire_id, out, n, timeout) {
            Ok(read) => Ok(read),
            Err(e) if e.kind() == crate::error::ErrorKind::Disconnected => {
                match conn.close_reason() {
                    Some(CloseReason::PeerEof) => Ok(0),
                    _ => Err(ChannelError::Unconnected),
                }
            }
            Err(e) => Err(ChannelError::from(e)),
        }
    }

    /// No-op for the TCP backend — `Send` is observed-complete as soon as
    /// the frame lands in the send ring (distilled spec §4.7/§5).
    pub fn flush(&self) {}

    fn lookup_connection(&self, peer_id: &str) -> ChannelResult<Arc<Connection>> {
        if let Some(peer) = self.topology.server_infos.iter().find(|p| p.id == peer_id) {
            return self.client.connect(peer).map_err(ChannelError::from);
        }
        if self.topology.client_infos.iter().any(|p| p.id == peer_id) {
            return self
                .server
                .connection_for(peer_id)
                .ok_or(ChannelError::Unconnected);
        }
        Err(ChannelError::UnknownPeer)
    }

    pub fn get_current_node_id(&self) -> &str {
        &self.current_node_id
    }

    pub fn get_data_node_ids(&self) -> Vec<String> {
        self.overlay.data_nodes.iter().cloned().collect()
    }

    pub fn get_result_node_ids(&self) -> Vec<String> {
        self.overlay.result_nodes.iter().cloned().collect()
    }

    /// Ids mapped to their party index, per the distilled spec's §4.7
    /// ("`GetComputationNodeIDs()` (ids → partyIndex)").
    pub fn get_computation_node_ids(&self) -> HashMap<String, i32> {
        self.overlay.computation_nodes.clone()
    }

    pub fn role(&self) -> Role {
        self.topology.role
    }

    /// Every peer this channel has an actively `Connected` connection to,
    /// cached after the first call.
    pub fn get_connected_node_ids(&self) -> Vec<String> {
        if let Some(cached) = self.connected_cache.lock().clone() {
            return cached;
        }
        let set: HashSet<String> = self
            .topology
            .all_peers()
            .filter_map(|p| self.server.connection_for(&p.id).or_else(|| self.client.connect(p).ok()))
            .filter(|c| c.is_reusable())
            .map(|c| c.peer_node_id().to_string())
            .collect();
        let list: Vec<String> = set.into_iter().collect();
        *self.connected_cache.lock() = Some(list.clone());
        list
    }

    /// Removes this channel's `taskId` mapping and calls `stop(taskId)`
    /// on every connection it references.
    pub fn destroy(channel: Arc<Channel>) {
        REGISTRY.lock().remove(&channel.task_id);
        for peer in channel.topology.all_peers() {
            if let Some(conn) = channel
                .server
                .connection_for(&peer.id)
                .or_else(|| channel.client.connect(peer).ok())
            {
                let _ = conn.stop(&channel.task_id);
            }
            channel.server.forget_client(&peer.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_json(a_port: u16, b_port: u16) -> String {
        two_node_json_named("P1", "P2", a_port, b_port)
    }

    /// `Channel::create` keeps one `Runtime` (and therefore one listening
    /// socket) alive per local node id for the lifetime of the process,
    /// so two tests must not reuse the same node id against two
    /// different ports — the second `Channel::create` would silently
    /// inherit the first test's already-bound listener.
    fn two_node_json_named(a_id: &str, b_id: &str, a_port: u16, b_port: u16) -> String {
        format!(
            r#"{{
                "NODE_INFO": [
                    {{"NODE_ID": "{a_id}", "HOST": "127.0.0.1", "PORT": {a_port}}},
                    {{"NODE_ID": "{b_id}", "HOST": "127.0.0.1", "PORT": {b_port}}}
                ],
                "DATA_NODES": ["{a_id}"],
                "COMPUTATION_NODES": {{"{b_id}": 0}},
                "CONNECT_PARAMS": {{"TIMEOUT": 2, "RETRIES": 3}}
            }}"#
        )
    }

    #[test]
    fn echo_loop_between_two_nodes() {
        let json = two_node_json(19101, 19102);
        let task_id = "echo-test-task";

        let p2 = std::thread::spawn({
            let json = json.clone();
            move || Channel::create(task_id, "P2", &json, None).unwrap()
        });
        std::thread::sleep(Duration::from_millis(100));
        let p1 = Channel::create(task_id, "P1", &json, None).unwrap();
        let p2 = p2.join().unwrap();

        p1.send("P2", "f00d", b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = p2.recv("P1", "f00d", &mut buf, 5, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        Channel::destroy(p1);
        Channel::destroy(p2);
    }

    /// A second task between the same pair of nodes reuses the pooled
    /// `Connection` (same fd) instead of dialing again, per the distilled
    /// spec's §8 "Reuse across tasks" scenario.
    #[test]
    fn connection_is_reused_across_tasks() {
        let json = two_node_json_named("R1", "R2", 19103, 19104);

        let r2_t1 = std::thread::spawn({
            let json = json.clone();
            move || Channel::create("reuse-task-1", "R2", &json, None).unwrap()
        });
        std::thread::sleep(Duration::from_millis(100));
        let r1_t1 = Channel::create("reuse-task-1", "R1", &json, None).unwrap();
        let r2_t1 = r2_t1.join().unwrap();

        r1_t1.send("R2", "beef", b"hi").unwrap();
        let mut buf = [0u8; 2];
        r2_t1.recv("R1", "beef", &mut buf, 2, Some(Duration::from_secs(2))).unwrap();

        let peer = r1_t1.topology.server_infos.iter().find(|n| n.id == "R2").unwrap().clone();
        let fd_t1 = r1_t1.client.connect(&peer).unwrap().raw_fd();

        Channel::destroy(r1_t1);
        Channel::destroy(r2_t1);

        let r2_t2 = std::thread::spawn({
            let json = json.clone();
            move || Channel::create("reuse-task-2", "R2", &json, None).unwrap()
        });
        std::thread::sleep(Duration::from_millis(100));
        let r1_t2 = Channel::create("reuse-task-2", "R1", &json, None).unwrap();
        let r2_t2 = r2_t2.join().unwrap();

        let fd_t2 = r1_t2.client.connect(&peer).unwrap().raw_fd();
        assert_eq!(fd_t1, fd_t2);

        Channel::destroy(r1_t2);
        Channel::destroy(r2_t2);
    }
}
