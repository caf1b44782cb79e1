//! Connection handshake between a participant and the coordinator.
//!
//! Each connection opens with a [`Hello`] frame naming the participant,
//! answered by a [`HelloAck`]. Only after the handshake do protocol
//! envelopes flow on the connection.

use serde::{Deserialize, Serialize};

use crate::ident::NodeId;

/// First frame on a participant connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub node: NodeId,
}

/// Coordinator's reply to a [`Hello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HelloAck {
    Ok,
    /// The coordinator refused the registration (e.g. empty node name).
    Rejected(String),
}
