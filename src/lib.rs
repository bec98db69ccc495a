//! `conduit` is an in-process messaging layer for distributed
//! multi-party computation jobs: given an overlay configuration
//! describing every participant, it resolves who dials whom, maintains
//! one pooled TCP (optionally TLS) connection per peer pair shared
//! across every task that talks to that peer, and multiplexes
//! self-delimited, message-id-tagged byte streams over it.
//!
//! The public entry point is [`channel::Channel`]: `Channel::create`
//! stands up (or joins) the connections for a task, `send`/`recv` move
//! bytes, and `Channel::destroy` tears the task down without closing
//! connections other tasks may still be using.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod runtime;
pub mod server;
pub mod socket;
pub mod topology;

pub use channel::{Channel, ChannelError, ChannelResult};
pub use config::OverlayConfig;
pub use error::{Error, ErrorKind, Result};
pub use topology::Role;
