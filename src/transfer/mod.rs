//! File-transfer protocol: wire bodies, the symmetric handshake, and the
//! send-side state machine. The receive side lives with the receiver
//! engine, next to the filesystem state it manages.

pub mod handshake;
pub mod send;
pub mod wire;

pub use handshake::{establish, Link, Role};
pub use send::{send_file, SendOutcome};
pub use wire::{MsgType, NewFile, PROTOCOL_VERSION};
