//! Cross-process exchange of device-memory handles. Ring neighbors meet
//! over filesystem-namespaced unix sockets, transfer one descriptor per
//! buffer slot through the ancillary-data channel, and record the imported
//! handles by (peer rank, slot). Failure at any step is fatal to the
//! enclosing collective setup; there is no partial-mesh fallback.

pub mod rendezvous;
pub mod socket;

use std::collections::HashMap;

use thiserror::Error;

use crate::driver::{DevicePtr, DriverError};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous with peer {peer} timed out after {attempts} attempts")]
    Timeout { peer: usize, attempts: u32 },
    #[error("peer hello carried bad magic {got:#x}")]
    BadMagic { got: u64 },
    #[error("connection closed before a descriptor arrived")]
    ShortTransfer,
    #[error("no ancillary descriptor in control message")]
    MissingDescriptor,
    #[error("no rendezvous endpoint for peer {0}")]
    UnknownPeer(usize),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Imported reference to a peer process's device allocation. Read-only
/// once recorded; writes go through the addressed device memory itself,
/// under the collective algorithm's write discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerMemoryHandle {
    pub ptr: DevicePtr,
    pub offset: u64,
}

impl PeerMemoryHandle {
    pub fn addr(&self) -> DevicePtr {
        self.ptr.with_offset(self.offset)
    }
}

/// Peer handles indexed by (peer rank, buffer slot). Skip-marked ranks
/// simply never appear.
#[derive(Default)]
pub struct HandleRegistry {
    handles: HashMap<(usize, usize), PeerMemoryHandle>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: usize, slot: usize, handle: PeerMemoryHandle) {
        self.handles.insert((peer, slot), handle);
    }

    pub fn get(&self, peer: usize, slot: usize) -> Option<&PeerMemoryHandle> {
        self.handles.get(&(peer, slot))
    }

    pub fn contains_peer(&self, peer: usize) -> bool {
        self.handles.keys().any(|(p, _)| *p == peer)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
