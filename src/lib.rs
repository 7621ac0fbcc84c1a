//! fileferry - reliable, authenticated file transfer between daemons.
//!
//! A sender watches a directory and delivers each dropped file to one or
//! more peers; a receiver accepts files and lands them atomically in a
//! destination directory. Everything rides on a multiplexed message bus
//! over one TCP (optionally TLS) connection per peer.
//!
//! # Architecture
//!
//! ```text
//! incoming/ --> intake --> per-peer queues --> transfer protocol
//!                |              (high/low)         |
//!                +--> local mirrors                v
//!                                        placeholder + dot-file --> rename
//! ```
//!
//! The crate splits into:
//! - [`transport`]: channels, connections, groups, framing, TLS
//! - [`transfer`]: the file-transfer wire protocol and send state machine
//! - [`sender`] / [`receiver`]: the two daemon engines
//! - [`multiqueue`] / [`intmap`]: the queueing and indexing primitives

pub mod config;
pub mod error;
pub mod fsutil;
pub mod intmap;
pub mod logging;
pub mod multiqueue;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod transfer;
pub mod transport;

pub use config::{ReceiverConfig, SenderConfig};
pub use error::{Error, Result};
pub use shutdown::Shutdown;
