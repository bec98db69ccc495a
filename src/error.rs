//! Error handling shared by every layer of `conduit`.
//!
//! Mirrors the extension-trait style used throughout the crate: instead of
//! `.unwrap()`ing on the hot path, fallible `std` calls get routed through
//! `ResultWrappedExt`/`ResultSimpleExt` into our own [`Error`] type, tagged
//! with an [`ErrorKind`].

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type, used to wrap its
/// error in a `conduit::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait drops the underlying
/// error type, which is useful when the error type doesn't implement
/// `Send`, or when its message is not worth keeping around.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg.to_string()))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation, with
    /// kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`, with kind of type
    /// `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Io, e)
    }
}

impl error::Error for Error {}

/// Coarse classification of every failure `conduit` can produce.
///
/// Kept as a hand-written enum rather than generated via `build.rs` (the
/// teacher's approach) so the crate builds without a code-generation step
/// — see DESIGN.md's "hand-written `ErrorKind`" entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The overlay configuration document was missing a required section
    /// or named an invalid node.
    Config,
    /// Dialing a peer failed, after exhausting the retry budget.
    Connect,
    /// The identification handshake (ACK byte / client-id exchange / TLS)
    /// failed.
    Handshake,
    /// A frame could not be decoded, or its fields violate an invariant.
    Framing,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// The peer closed the connection, or it is no longer `Connected`.
    Disconnected,
    /// A message violated the wire protocol (e.g. unknown client-id).
    Protocol,
    /// A lower-level I/O error that doesn't fit another kind.
    Io,
    /// A `Channel`-level misuse (unknown peer, unknown task, etc).
    Channel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_error_keeps_kind() {
        let e = Error::simple(ErrorKind::Timeout);
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn wrapped_error_formats_source() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let e = Error::wrapped(ErrorKind::Io, io_err);
        assert!(format!("{}", e).contains("boom"));
    }

    #[test]
    fn swap_kind_preserves_wrapped_source() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let e = Error::wrapped(ErrorKind::Io, io_err).swap_kind(ErrorKind::Connect);
        assert_eq!(e.kind(), ErrorKind::Connect);
        assert!(format!("{}", e).contains("boom"));
    }

    #[test]
    fn result_ext_wraps_and_simplifies() {
        let r: result::Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::Other, "x"));
        let wrapped = r.wrapped(ErrorKind::Io);
        assert_eq!(wrapped.unwrap_err().kind(), ErrorKind::Io);

        let r2: result::Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::Other, "x"));
        let simple = r2.simple(ErrorKind::Channel);
        assert_eq!(simple.unwrap_err().kind(), ErrorKind::Channel);
    }
}
