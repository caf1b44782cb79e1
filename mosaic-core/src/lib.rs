//! Mosaic Core - shared types for the commit coordinator and participants
//!
//! This crate provides the common vocabulary used by both the coordinator
//! (server/driver side) and participant (user-node side) implementations:
//! node and commit identifiers, the wire envelope and its framing codec,
//! the connection handshake, and the durable-filesystem helpers both sides
//! rely on for crash safety.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod fsio;
pub mod handshake;
pub mod ident;

pub use codec::PostcardCodec;
pub use envelope::{Decision, Envelope, MessageKind};
pub use error::WireError;
pub use handshake::{Hello, HelloAck};
pub use ident::{CommitId, NodeId};

/// Sub-directory (under a node's root) holding write-ahead logs.
pub const LOG_DIR: &str = "log";
