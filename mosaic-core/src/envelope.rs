//! The wire envelope exchanged between coordinator and participants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ident::{CommitId, NodeId};

/// Kind of a protocol message.
///
/// Postcard encodes enum variants by index, and peers on the same wire
/// agree on that integer ordering, so the declaration order here is part
/// of the wire format. Do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Phase I: coordinator asks a participant to vote on a commit.
    CommitQuery,
    /// Phase I: participant's vote.
    CommitAgreement,
    /// Phase II: coordinator's yes/no decision.
    CommitDecision,
    /// Phase II: participant's acknowledgement.
    CommitAck,
    /// Phase II: coordinator aborts a commit that timed out in Phase I.
    CommitAbort,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::CommitQuery => "COMMIT_QUERY",
            MessageKind::CommitAgreement => "COMMIT_AGREEMENT",
            MessageKind::CommitDecision => "COMMIT_MSG",
            MessageKind::CommitAck => "COMMIT_ACK",
            MessageKind::CommitAbort => "COMMIT_ABORT",
        };
        f.write_str(s)
    }
}

/// Outcome of Phase I.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Every participant approved.
    Yes,
    /// At least one participant refused.
    No,
    /// A participant timed out or the vote window expired.
    Abort,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Yes => "YES",
            Decision::No => "NO",
            Decision::Abort => "ABORT",
        };
        f.write_str(s)
    }
}

/// Error parsing a [`Decision`] from its log representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDecision(pub String);

impl fmt::Display for InvalidDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid commit decision: {:?}", self.0)
    }
}

impl std::error::Error for InvalidDecision {}

impl FromStr for Decision {
    type Err = InvalidDecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "YES" => Ok(Decision::Yes),
            "NO" => Ok(Decision::No),
            "ABORT" => Ok(Decision::Abort),
            other => Err(InvalidDecision(other.to_owned())),
        }
    }
}

/// A single protocol message.
///
/// The envelope is deliberately flat: every message carries the commit it
/// belongs to plus sender/receiver names, and the optional fields are
/// populated per [`MessageKind`]. Serialization must round-trip losslessly;
/// postcard over [`crate::PostcardCodec`] provides that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub commit_id: CommitId,
    pub sender: NodeId,
    pub receiver: NodeId,
    /// Vote (in `CommitAgreement`) or decision (in `CommitDecision`).
    pub agreement: Option<bool>,
    /// Composite payload, present only in `CommitQuery`.
    pub image: Option<Vec<u8>>,
    /// The receiver's contributed source files, present in `CommitQuery`,
    /// `CommitDecision` and `CommitAbort`.
    pub files: Option<Vec<String>>,
}

impl Envelope {
    /// Phase I query from the coordinator to one participant.
    #[must_use]
    pub fn query(commit_id: CommitId, receiver: NodeId, files: Vec<String>, image: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::CommitQuery,
            commit_id,
            sender: NodeId::coordinator(),
            receiver,
            agreement: None,
            image: Some(image),
            files: Some(files),
        }
    }

    /// Phase I vote from a participant.
    #[must_use]
    pub fn agreement(commit_id: CommitId, sender: NodeId, ok: bool) -> Self {
        Self {
            kind: MessageKind::CommitAgreement,
            commit_id,
            sender,
            receiver: NodeId::coordinator(),
            agreement: Some(ok),
            image: None,
            files: None,
        }
    }

    /// Phase II decision broadcast to one participant.
    #[must_use]
    pub fn decision(commit_id: CommitId, receiver: NodeId, files: Vec<String>, commit: bool) -> Self {
        Self {
            kind: MessageKind::CommitDecision,
            commit_id,
            sender: NodeId::coordinator(),
            receiver,
            agreement: Some(commit),
            image: None,
            files: Some(files),
        }
    }

    /// Phase II abort broadcast to one participant.
    #[must_use]
    pub fn abort(commit_id: CommitId, receiver: NodeId, files: Vec<String>) -> Self {
        Self {
            kind: MessageKind::CommitAbort,
            commit_id,
            sender: NodeId::coordinator(),
            receiver,
            agreement: None,
            image: None,
            files: Some(files),
        }
    }

    /// Phase II acknowledgement from a participant.
    #[must_use]
    pub fn ack(commit_id: CommitId, sender: NodeId) -> Self {
        Self {
            kind: MessageKind::CommitAck,
            commit_id,
            sender,
            receiver: NodeId::coordinator(),
            agreement: None,
            image: None,
            files: None,
        }
    }

    /// The file list, or empty when the message carries none.
    #[must_use]
    pub fn files(&self) -> &[String] {
        self.files.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_round_trips_through_log_form() {
        for d in [Decision::Yes, Decision::No, Decision::Abort] {
            assert_eq!(d.to_string().parse::<Decision>().unwrap(), d);
        }
        assert!("MAYBE".parse::<Decision>().is_err());
    }

    #[test]
    fn envelope_round_trips_through_postcard() {
        let env = Envelope::query(
            CommitId::new("composites/1.jpg"),
            NodeId::new("a"),
            vec!["1.jpg".to_owned()],
            vec![0xde, 0xad],
        );
        let bytes = postcard::to_allocvec(&env).unwrap();
        let back: Envelope = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.kind, MessageKind::CommitQuery);
        assert_eq!(back.commit_id, env.commit_id);
        assert_eq!(back.files(), ["1.jpg"]);
        assert_eq!(back.image.as_deref(), Some(&[0xde, 0xad][..]));
    }
}
