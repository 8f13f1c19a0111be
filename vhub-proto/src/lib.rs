//! Wire protocol for the Blackmagic Videohub TCP control interface.
//!
//! The protocol is plain text: a *block* is a verb line ending in `:`
//! followed by zero or more data lines and a terminating blank line.
//! `ACK`/`NAK` replies are bare one-line blocks. This crate parses and
//! serializes blocks; it performs no I/O.

mod codec;
mod message;

pub use codec::{parse, serialize};
pub use message::{Block, DEFAULT_PORT, Entry, Value, Verb};
