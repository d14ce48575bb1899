//! Point-to-point transport capability consumed by schedule entries. The
//! runtime treats it as an opaque asynchronous send/recv facility: sends
//! are posted without blocking and receives are polled. The in-process
//! fabric in [`local`] is the reference implementation used by tests and
//! demos; real network/shared-memory transports plug in behind the same
//! trait.

pub mod local;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport family the communicator was created over. Selection
/// constraints key off this (e.g. direct algorithms delegate to the MPI
/// library and are inadmissible on the fabric transport).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Fabric,
    Mpi,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer rank {0} is out of range")]
    UnknownPeer(usize),
    #[error("fabric disconnected while {0}")]
    Disconnected(&'static str),
    #[error("receive length mismatch: got {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

/// One rank's attachment to the fabric.
pub trait Endpoint: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Post an outgoing message. Never blocks; delivery is asynchronous.
    fn post_send(&mut self, peer: usize, tag: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Poll for a message from `peer` with a matching `tag`. Copies the
    /// payload into `buf` and returns true when one has arrived; returns
    /// false without blocking otherwise.
    fn try_recv(&mut self, peer: usize, tag: u64, buf: &mut [u8]) -> Result<bool, TransportError>;
}
