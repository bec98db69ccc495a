//! A small socket abstraction unifying plain TCP and (optionally) TLS
//! behind one `Read + Write` type, in the same spirit as the teacher's
//! `communication::socket::async_std_tcp::Socket` wrapper — but
//! synchronous, since `conduit` is built on blocking OS threads rather
//! than an async runtime.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, Result};

/// Configuration needed to originate or accept TLS connections. Callers
/// build these themselves (certificate *loading* is explicitly out of
/// scope per the distilled spec's §1) and hand them to
/// [`crate::client::Client`] / [`crate::server::Server`].
#[cfg(feature = "tls_rustls")]
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    pub server_config: Arc<rustls::ServerConfig>,
}

/// A connected socket, plain or TLS. Implements `Read`/`Write` so the
/// rest of the crate never needs to know which one it has.
pub enum Socket {
    Plain(TcpStream),
    #[cfg(feature = "tls_rustls")]
    TlsClient(Box<rustls::StreamOwned<rustls::ClientSession, TcpStream>>),
    #[cfg(feature = "tls_rustls")]
    TlsServer(Box<rustls::StreamOwned<rustls::ServerSession, TcpStream>>),
}

impl Socket {
    /// Opens a plain TCP connection to `addr`, bounded by `timeout`.
    pub fn connect_plain(addr: SocketAddr, timeout: Duration) -> io::Result<Socket> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Socket::Plain(stream))
    }

    /// Wraps an already-connected `TcpStream` with a client-side TLS
    /// session, performing the handshake inline (rustls 0.19's
    /// `StreamOwned` drives the handshake lazily on first I/O, so we
    /// force it here with a zero-length write to surface handshake
    /// failures immediately, per the distilled spec's §4.4 step 4).
    #[cfg(feature = "tls_rustls")]
    pub fn wrap_tls_client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        hostname: &str,
    ) -> Result<Socket> {
        let dns_name = webpki::DNSNameRef::try_from_ascii_str(hostname)
            .wrapped_msg(ErrorKind::Handshake, "invalid TLS server name")?;
        let session = rustls::ClientSession::new(&config, dns_name);
        let mut owned = rustls::StreamOwned::new(session, stream);
        owned
            .flush()
            .wrapped_msg(ErrorKind::Handshake, "TLS client handshake failed")?;
        Ok(Socket::TlsClient(Box::new(owned)))
    }

    /// Wraps an accepted `TcpStream` with a server-side TLS session.
    #[cfg(feature = "tls_rustls")]
    pub fn wrap_tls_server(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Socket> {
        let session = rustls::ServerSession::new(&config);
        let mut owned = rustls::StreamOwned::new(session, stream);
        owned
            .flush()
            .wrapped_msg(ErrorKind::Handshake, "TLS server handshake failed")?;
        Ok(Socket::TlsServer(Box::new(owned)))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.tcp_stream().set_nonblocking(nonblocking)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp_stream().set_read_timeout(timeout)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_stream().peer_addr()
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        self.tcp_stream().shutdown(how)
    }

    fn tcp_stream(&self) -> &TcpStream {
        match self {
            Socket::Plain(s) => s,
            #[cfg(feature = "tls_rustls")]
            Socket::TlsClient(s) => &s.sock,
            #[cfg(feature = "tls_rustls")]
            Socket::TlsServer(s) => &s.sock,
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp_stream().as_raw_fd()
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(s) => s.read(buf),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsClient(s) => s.read(buf),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsServer(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(s) => s.write(buf),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsClient(s) => s.write(buf),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsServer(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.flush(),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsClient(s) => s.flush(),
            #[cfg(feature = "tls_rustls")]
            Socket::TlsServer(s) => s.flush(),
        }
    }
}

use crate::error::ResultWrappedExt;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn plain_connect_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let mut sock = Socket::connect_plain(addr, Duration::from_secs(1)).unwrap();
        sock.write_all(b"hello").unwrap();
        let mut out = [0u8; 5];
        sock.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        server.join().unwrap();
    }
}
