//! Operator decision oracle.

use std::future::Future;

/// Asked once per commit query whether this node assents to contributing
/// the named files to the proposed composite.
///
/// The protocol treats the oracle as external policy: a `false` answer
/// surfaces as a no-vote, nothing more.
pub trait Oracle: Send + Sync + 'static {
    fn approve(&self, image: &[u8], files: &[String]) -> impl Future<Output = bool> + Send;
}

/// Policy that assents to every query, leaving the vote to the file checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl Oracle for ApproveAll {
    async fn approve(&self, _image: &[u8], _files: &[String]) -> bool {
        true
    }
}
