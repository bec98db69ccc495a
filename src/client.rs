//! `Client`: dials a peer, performs the identification handshake, and
//! publishes the resulting [`Connection`] into the shared pool so other
//! tasks reuse it instead of opening a second socket.
//!
//! Grounded in the teacher's `Node::tx_side_connect`/`tx_side_connect_task`
//! retry-with-backoff dial loop, adapted from `async-std`'s `TcpStream` to
//! blocking `std::net::TcpStream` plus [`crate::socket::Socket`].

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::connection::{Connection, ErrorCallback};
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};
use crate::runtime::Runtime;
use crate::socket::Socket;
#[cfg(feature = "tls_rustls")]
use crate::socket::TlsConfig;
use crate::topology::ServerInfo;

/// Fixed backoff between dial attempts, per the distilled spec's §4.4
/// retry loop ("back off `500ms` between attempts").
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct Client {
    runtime: Arc<Runtime>,
    local_node_id: String,
    connect_timeout: Duration,
    connect_retries: u32,
    #[cfg(feature = "tls_rustls")]
    tls: Option<TlsConfig>,
    error_callback: Option<ErrorCallback>,
}

impl Client {
    pub fn new(
        runtime: Arc<Runtime>,
        local_node_id: String,
        connect_timeout: Duration,
        connect_retries: u32,
        #[cfg(feature = "tls_rustls")] tls: Option<TlsConfig>,
        error_callback: Option<ErrorCallback>,
    ) -> Self {
        Client {
            runtime,
            local_node_id,
            connect_timeout,
            connect_retries,
            #[cfg(feature = "tls_rustls")]
            tls,
            error_callback,
        }
    }

    /// Returns a `Connected` connection to `peer`, reusing a pooled
    /// connection if one is reusable, joining an in-flight dial to the
    /// same peer if one is underway, or dialing fresh otherwise.
    pub fn connect(&self, peer: &ServerInfo) -> Result<Arc<Connection>> {
        let key = pool_key(peer);

        if let Some(conn) = self.runtime.client_pool_get(&key) {
            return Ok(conn);
        }

        let handle = self.runtime.begin_dial(&key);
        if !handle.is_leader() {
            return handle
                .wait(self.connect_timeout + Duration::from_secs(5))
                .ok_or_else(|| Error::simple(ErrorKind::Connect));
        }

        let result = self.dial_with_retry(peer);
        let conn = match &result {
            Ok(conn) => Some(Arc::clone(conn)),
            Err(_) => None,
        };
        handle.complete(&self.runtime, conn);
        result
    }

    fn dial_with_retry(&self, peer: &ServerInfo) -> Result<Arc<Connection>> {
        let addr = resolve(peer)?;
        let mut last_err = None;
        for attempt in 0..self.connect_retries.max(1) {
            match self.dial_once(peer, addr) {
                Ok(conn) => {
                    let key = pool_key(peer);
                    self.runtime.client_pool_insert(key, Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.id, attempt, error = %e, "dial attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < self.connect_retries.max(1) {
                        thread::sleep(RETRY_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::simple(ErrorKind::Connect)))
    }

    fn dial_once(&self, peer: &ServerInfo, addr: SocketAddr) -> Result<Arc<Connection>> {
        let stream = Socket::connect_plain(addr, self.connect_timeout)
            .wrapped_msg(ErrorKind::Connect, "dial failed")?;

        let mut sock = stream;
        let mut ack = [0u8; 1];
        sock.read_exact(&mut ack).wrapped_msg(ErrorKind::Handshake, "ack read failed")?;

        let id_bytes = self.local_node_id.as_bytes();
        sock.write_all(&(id_bytes.len() as u64).to_le_bytes())
            .wrapped_msg(ErrorKind::Handshake, "id length write failed")?;
        sock.write_all(id_bytes)
            .wrapped_msg(ErrorKind::Handshake, "id write failed")?;

        #[cfg(feature = "tls_rustls")]
        let sock = if let Some(tls) = &self.tls {
            let tcp = match sock {
                Socket::Plain(tcp) => tcp,
                _ => return Err(Error::simple(ErrorKind::Handshake)),
            };
            Socket::wrap_tls_client(tcp, Arc::clone(&tls.client_config), &peer.id)?
        } else {
            sock
        };

        sock.set_nonblocking(true).wrapped_msg(ErrorKind::Handshake, "nonblocking switch failed")?;

        let conn = Connection::new(
            self.local_node_id.clone(),
            peer.id.clone(),
            false,
            sock,
            self.error_callback.clone(),
        );
        self.runtime
            .register_connection(Arc::clone(&conn))
            .wrapped_msg(ErrorKind::Connect, "reactor registration failed")?;
        Ok(conn)
    }
}

fn pool_key(peer: &ServerInfo) -> String {
    format!("{}:{}", peer.host, peer.port)
}

fn resolve(peer: &ServerInfo) -> Result<SocketAddr> {
    (peer.host.as_str(), peer.port)
        .to_socket_addrs()
        .wrapped_msg(ErrorKind::Connect, "address resolution failed")?
        .next()
        .ok_or_else(|| Error::simple(ErrorKind::Connect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSpec;
    use std::net::TcpListener;

    fn spawn_accepting_peer(id: &'static str) -> (NodeSpec, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&[1u8]).unwrap();
            let mut len_buf = [0u8; 8];
            sock.read_exact(&mut len_buf).unwrap();
            let id_len = u64::from_le_bytes(len_buf) as usize;
            let mut id_buf = vec![0u8; id_len];
            sock.read_exact(&mut id_buf).unwrap();
        });
        (
            NodeSpec {
                id: id.to_string(),
                name: id.to_string(),
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            handle,
        )
    }

    #[test]
    fn connect_performs_handshake_and_pools_connection() {
        let (peer, server_handle) = spawn_accepting_peer("peer-a");
        let runtime = Arc::new(Runtime::new().unwrap());
        let client = Client::new(
            Arc::clone(&runtime),
            "self".to_string(),
            Duration::from_secs(2),
            1,
            #[cfg(feature = "tls_rustls")]
            None,
            None,
        );

        let conn = client.connect(&peer).unwrap();
        assert_eq!(conn.peer_node_id(), "peer-a");

        let pooled = client.connect(&peer).unwrap();
        assert_eq!(pooled.raw_fd(), conn.raw_fd());

        server_handle.join().unwrap();
        runtime.shutdown();
    }

    #[test]
    fn dial_to_closed_port_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // nothing listening now

        let peer = NodeSpec {
            id: "ghost".to_string(),
            name: "ghost".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let runtime = Arc::new(Runtime::new().unwrap());
        let client = Client::new(
            Arc::clone(&runtime),
            "self".to_string(),
            Duration::from_millis(200),
            2,
            #[cfg(feature = "tls_rustls")]
            None,
            None,
        );
        let err = client.connect(&peer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
        runtime.shutdown();
    }
}
