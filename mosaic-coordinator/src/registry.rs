//! Registries for connected participants and in-flight commits.
//!
//! The connection handler is the single producer into a commit's queues;
//! the commit's driver task is the single consumer. Inbound messages are
//! dispatched by their commit id; messages for unknown commits can only
//! come from a commit already `DONE` (or corrupt traffic) and are dropped
//! with a log line.

use std::collections::HashMap;
use std::sync::RwLock;

use mosaic_core::{CommitId, Envelope, MessageKind, NodeId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sender endpoints for one in-flight commit's vote and ack queues.
pub(crate) struct CommitHandle {
    votes: mpsc::UnboundedSender<Envelope>,
    acks: mpsc::UnboundedSender<Envelope>,
}

/// Receiver ends handed to the commit's driver.
pub(crate) struct CommitQueues {
    pub votes: mpsc::UnboundedReceiver<Envelope>,
    pub acks: mpsc::UnboundedReceiver<Envelope>,
}

/// Process-wide mutable state: connected peers and live commits.
#[derive(Default)]
pub(crate) struct Registry {
    peers: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    commits: RwLock<HashMap<CommitId, CommitHandle>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a participant connection's outbound queue, replacing any
    /// previous connection for the same node (newest wins).
    pub(crate) fn register_peer(&self, node: &NodeId, tx: mpsc::UnboundedSender<Envelope>) {
        self.peers
            .write()
            .expect("peer map poisoned")
            .insert(node.clone(), tx);
    }

    /// Drop a participant connection, but only if it is still the current
    /// one; a reconnect may already have replaced it.
    pub(crate) fn unregister_peer(&self, node: &NodeId, tx: &mpsc::UnboundedSender<Envelope>) {
        let mut peers = self.peers.write().expect("peer map poisoned");
        if peers.get(node).is_some_and(|cur| cur.same_channel(tx)) {
            peers.remove(node);
        }
    }

    /// Names of currently connected participants.
    pub(crate) fn connected_peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .expect("peer map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Best-effort send to the envelope's receiver. An unreachable node is
    /// silence, which the protocol's timeouts handle.
    pub(crate) fn send(&self, env: Envelope) {
        let peers = self.peers.read().expect("peer map poisoned");
        match peers.get(&env.receiver) {
            Some(tx) => {
                if tx.send(env).is_err() {
                    debug!("peer connection closed mid-send");
                }
            }
            None => debug!(receiver = %env.receiver, kind = %env.kind, "peer not connected, message dropped"),
        }
    }

    /// Register a commit, refusing a duplicate of a live one.
    pub(crate) fn register_commit(&self, commit: &CommitId) -> Option<CommitQueues> {
        let mut commits = self.commits.write().expect("commit table poisoned");
        if commits.contains_key(commit) {
            return None;
        }
        let (vote_tx, vote_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        commits.insert(
            commit.clone(),
            CommitHandle {
                votes: vote_tx,
                acks: ack_tx,
            },
        );
        Some(CommitQueues {
            votes: vote_rx,
            acks: ack_rx,
        })
    }

    pub(crate) fn remove_commit(&self, commit: &CommitId) {
        self.commits
            .write()
            .expect("commit table poisoned")
            .remove(commit);
    }

    /// Dispatch an inbound message to the owning commit's queue.
    pub(crate) fn route(&self, env: Envelope) {
        let commits = self.commits.read().expect("commit table poisoned");
        let Some(handle) = commits.get(&env.commit_id) else {
            debug!(commit = %env.commit_id, kind = %env.kind, sender = %env.sender,
                   "message for unknown commit dropped");
            return;
        };
        let result = match env.kind {
            MessageKind::CommitAgreement => handle.votes.send(env),
            MessageKind::CommitAck => handle.acks.send(env),
            _ => {
                warn!(kind = %env.kind, sender = %env.sender, "unexpected inbound message kind");
                return;
            }
        };
        if result.is_err() {
            // Driver already finished; the late reply is harmless.
            debug!("commit driver gone, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_commit_is_refused() {
        let registry = Registry::new();
        let commit = CommitId::new("c.jpg");
        assert!(registry.register_commit(&commit).is_some());
        assert!(registry.register_commit(&commit).is_none());
        registry.remove_commit(&commit);
        assert!(registry.register_commit(&commit).is_some());
    }

    #[tokio::test]
    async fn route_dispatches_votes_and_acks() {
        let registry = Registry::new();
        let commit = CommitId::new("c.jpg");
        let mut queues = registry.register_commit(&commit).unwrap();

        registry.route(Envelope::agreement(commit.clone(), NodeId::new("a"), true));
        registry.route(Envelope::ack(commit.clone(), NodeId::new("a")));
        // Unknown commit: dropped without panicking.
        registry.route(Envelope::ack(CommitId::new("other.jpg"), NodeId::new("a")));

        let vote = queues.votes.recv().await.unwrap();
        assert_eq!(vote.agreement, Some(true));
        let ack = queues.acks.recv().await.unwrap();
        assert_eq!(ack.kind, MessageKind::CommitAck);
    }

    #[test]
    fn newest_peer_connection_wins() {
        let registry = Registry::new();
        let node = NodeId::new("a");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        registry.register_peer(&node, tx1.clone());
        registry.register_peer(&node, tx2);
        // Old connection's teardown must not evict the replacement.
        registry.unregister_peer(&node, &tx1);

        registry.send(Envelope::abort(CommitId::new("c.jpg"), node.clone(), vec![]));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
