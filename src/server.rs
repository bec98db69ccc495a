//! `Server`: the listening side of a peer pair. The actual accept loop
//! and identification handshake live on the shared reactor
//! ([`crate::runtime::Runtime`]) since every inbound connection, for
//! every task, is serviced by the one epoll instance; this module is the
//! thin facade a [`crate::channel::Channel`] drives to bind, declare
//! which client ids it expects, and look connections back up.
//!
//! Grounded in the teacher's `Node::rx_side_accept`/`rx_side_accept_task`
//! split — accept once, then hand each task its own view of the
//! resulting connection — adapted to the blocking/epoll model.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::{Connection, ErrorCallback};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::Runtime;
#[cfg(feature = "tls_rustls")]
use crate::socket::TlsConfig;

pub struct Server {
    runtime: Arc<Runtime>,
    local_node_id: String,
}

impl Server {
    pub fn new(runtime: Arc<Runtime>, local_node_id: String) -> Self {
        Server { runtime, local_node_id }
    }

    /// Binds (idempotently) the shared listening socket on `bind_addr`.
    /// When `tls` is set, every accepted connection performs a
    /// server-side TLS handshake right after the id-exchange handshake,
    /// mirroring the order `Client::dial_once` uses on the dialing side
    /// (distilled spec §4.4/§6: "when enabled globally, both Client and
    /// Server use TLS").
    pub fn listen(
        &self,
        bind_addr: SocketAddr,
        error_callback: Option<ErrorCallback>,
        #[cfg(feature = "tls_rustls")] tls: Option<TlsConfig>,
    ) -> Result<()> {
        self.runtime.ensure_listening(
            &self.local_node_id,
            bind_addr,
            error_callback,
            #[cfg(feature = "tls_rustls")]
            tls,
        )
    }

    /// Declares that `client_id` may now dial in for the lifetime of a
    /// task; the reactor's accept handshake rejects anyone else.
    pub fn expect_client(&self, client_id: &str) {
        self.runtime.expect_client(client_id);
    }

    pub fn forget_client(&self, client_id: &str) {
        self.runtime.forget_client(client_id);
    }

    /// Blocks (with polling) until `client_id` has dialed in and
    /// completed its handshake, or `timeout` elapses.
    pub fn wait_for_client(&self, client_id: &str, timeout: std::time::Duration) -> Result<Arc<Connection>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(conn) = self.runtime.server_pool_get(client_id) {
                return Ok(conn);
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::simple(ErrorKind::Timeout));
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    pub fn connection_for(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.runtime.server_pool_get(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::NodeSpec;
    use std::time::Duration;

    #[test]
    fn server_accepts_and_publishes_client_connection() {
        let runtime = Arc::new(Runtime::new().unwrap());
        let server = Server::new(Arc::clone(&runtime), "srv".to_string());
        server
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                None,
                #[cfg(feature = "tls_rustls")]
                None,
            )
            .unwrap();
        server.expect_client("cli");
        let bound = runtime.listener_local_addr().unwrap();

        let client = Client::new(
            Arc::clone(&runtime),
            "cli".to_string(),
            Duration::from_secs(2),
            1,
            #[cfg(feature = "tls_rustls")]
            None,
            None,
        );
        let peer = NodeSpec {
            id: "srv".to_string(),
            name: "srv".to_string(),
            host: bound.ip().to_string(),
            port: bound.port(),
        };
        let _client_conn = client.connect(&peer).unwrap();

        let server_conn = server.wait_for_client("cli", Duration::from_secs(2)).unwrap();
        assert_eq!(server_conn.peer_node_id(), "cli");

        runtime.shutdown();
    }
}
