//! In-process fabric: one unbounded channel per directed rank pair, with a
//! per-source stash so out-of-order tag matching never drops a message.

use std::collections::VecDeque;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use super::{Endpoint, TransportError};

struct Message {
    tag: u64,
    payload: Vec<u8>,
}

pub struct LocalEndpoint {
    rank: usize,
    num_ranks: usize,
    // indexed by destination rank
    txs: Vec<Sender<Message>>,
    // indexed by source rank
    rxs: Vec<Receiver<Message>>,
    stash: Vec<VecDeque<Message>>,
}

/// Builds the full mesh for `num_ranks` in-process ranks and hands each
/// rank its endpoint. Endpoints are meant to move onto their rank's
/// worker thread.
pub fn local_fabric(num_ranks: usize) -> Vec<LocalEndpoint> {
    let mut txs = vec![Vec::with_capacity(num_ranks); num_ranks];
    let mut rxs = vec![Vec::with_capacity(num_ranks); num_ranks];
    for src in 0..num_ranks {
        for dst in 0..num_ranks {
            let (tx, rx) = unbounded();
            txs[src].push(tx);
            rxs[dst].push(rx);
        }
    }
    txs.into_iter()
        .zip(rxs)
        .enumerate()
        .map(|(rank, (txs, rxs))| LocalEndpoint {
            rank,
            num_ranks,
            txs,
            rxs,
            stash: (0..num_ranks).map(|_| VecDeque::new()).collect(),
        })
        .collect()
}

impl LocalEndpoint {
    fn take_matching(&mut self, peer: usize, tag: u64) -> Option<Message> {
        let stash = &mut self.stash[peer];
        if let Some(pos) = stash.iter().position(|m| m.tag == tag) {
            return stash.remove(pos);
        }
        None
    }
}

impl Endpoint for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn post_send(&mut self, peer: usize, tag: u64, data: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .txs
            .get(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        tx.send(Message {
            tag,
            payload: data.to_vec(),
        })
        .map_err(|_| TransportError::Disconnected("sending"))
    }

    fn try_recv(&mut self, peer: usize, tag: u64, buf: &mut [u8]) -> Result<bool, TransportError> {
        if peer >= self.num_ranks {
            return Err(TransportError::UnknownPeer(peer));
        }
        // drain the wire into the stash, then match by tag
        loop {
            match self.rxs[peer].try_recv() {
                Ok(msg) => self.stash[peer].push_back(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.stash[peer].is_empty() {
                        return Err(TransportError::Disconnected("receiving"));
                    }
                    break;
                }
            }
        }
        match self.take_matching(peer, tag) {
            Some(msg) => {
                if msg.payload.len() != buf.len() {
                    return Err(TransportError::LengthMismatch {
                        got: msg.payload.len(),
                        expected: buf.len(),
                    });
                }
                buf.copy_from_slice(&msg.payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
