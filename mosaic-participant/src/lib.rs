//! Mosaic Participant
//!
//! A participant owns source files in its working directory and reacts to
//! coordinator messages: it votes on commit queries after consulting the
//! operator oracle and tentatively locking the named files, and on a
//! Phase II message either consumes (deletes) the locked files or releases
//! them, acknowledging in both cases.
//!
//! Every lock transition is appended to a single durable log before it
//! becomes externally observable, and replaying that log on startup
//! restores the lock table across crashes.

#![warn(clippy::pedantic)]

pub mod config;
pub mod connector;
pub mod node;
pub mod oracle;
pub mod wal;

pub use config::{BackoffConfig, ParticipantConfig};
pub use node::Participant;
pub use oracle::{ApproveAll, Oracle};
pub use wal::{FileStatus, LockLog, WalError};
