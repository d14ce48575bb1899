//! The exchange protocol itself, written against a capability interface so
//! the retry/ordering logic is testable without real sockets or a real
//! driver. Per directional peer pair: the lower logical order listens, the
//! higher connects; connection attempts are polled with a hard attempt
//! cap; once linked, the server pushes its slots first and then drains the
//! peer's, the client does the opposite, and both sides import what they
//! received.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use crate::driver::{DeviceDriver, DevicePtr};

use super::{ExchangeError, HandleRegistry, PeerMemoryHandle};

/// Established duplex link to one peer, able to move descriptors.
pub trait HandleLink {
    fn send_fd(&mut self, fd: BorrowedFd) -> Result<(), ExchangeError>;
    fn recv_fd(&mut self) -> Result<OwnedFd, ExchangeError>;
}

/// Connection-establishment capability. Attempts are single-shot and
/// non-blocking; the session owns the retry budget.
pub trait RendezvousTransport {
    type Link: HandleLink;

    fn try_accept(&mut self, peer: usize) -> Result<Option<Self::Link>, ExchangeError>;
    fn try_connect(&mut self, peer: usize) -> Result<Option<Self::Link>, ExchangeError>;

    /// Unlink/close every endpoint. Called once, after the last pair
    /// finishes.
    fn teardown(&mut self) -> Result<(), ExchangeError>;
}

/// One local buffer slot offered to the neighbors.
#[derive(Clone, Copy, Debug)]
pub struct BufferSlot {
    pub ptr: DevicePtr,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct PeerSpec {
    pub rank: usize,
    /// Skip-marked peers perform no device-resident step; their slots are
    /// left absent rather than probed.
    pub skipped: bool,
}

enum PairPhase {
    Connecting,
    Transfer,
    Done,
}

struct PairState<L> {
    peer: usize,
    peer_skipped: bool,
    server: bool,
    attempts: u32,
    phase: PairPhase,
    link: Option<L>,
}

pub struct ExchangeSession<T: RendezvousTransport> {
    transport: T,
    rank: usize,
    slots: Vec<BufferSlot>,
    self_skipped: bool,
    max_attempts: u32,
    /// Pause after a failed connection attempt. This is the one
    /// intentionally blocking wait in the runtime: a bounded, one-time
    /// setup cost.
    poll_interval: Duration,
    pairs: Vec<PairState<T::Link>>,
    torn_down: bool,
}

impl<T: RendezvousTransport> ExchangeSession<T> {
    pub fn new(
        transport: T,
        rank: usize,
        peers: &[PeerSpec],
        slots: Vec<BufferSlot>,
        self_skipped: bool,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        let pairs = peers
            .iter()
            // nothing to move in either direction: leave the pair silent
            .filter(|p| !(p.skipped && self_skipped))
            .map(|p| PairState {
                peer: p.rank,
                peer_skipped: p.skipped,
                server: rank < p.rank,
                attempts: 0,
                phase: PairPhase::Connecting,
                link: None,
            })
            .collect();
        ExchangeSession {
            transport,
            rank,
            slots,
            self_skipped,
            max_attempts,
            poll_interval,
            pairs,
            torn_down: false,
        }
    }

    /// Drives every pair one step. Returns true once all pairs are done
    /// and the endpoints are torn down.
    pub fn progress(
        &mut self,
        driver: &dyn DeviceDriver,
        registry: &mut HandleRegistry,
    ) -> Result<bool, ExchangeError> {
        let mut all_done = true;
        for pair in self.pairs.iter_mut() {
            match pair.phase {
                PairPhase::Connecting => {
                    let link = if pair.server {
                        self.transport.try_accept(pair.peer)?
                    } else {
                        self.transport.try_connect(pair.peer)?
                    };
                    match link {
                        Some(link) => {
                            log::debug!(
                                "rank {} linked with peer {} after {} attempts",
                                self.rank,
                                pair.peer,
                                pair.attempts
                            );
                            pair.link = Some(link);
                            pair.phase = PairPhase::Transfer;
                            all_done = false;
                        }
                        None => {
                            pair.attempts += 1;
                            if pair.attempts >= self.max_attempts {
                                return Err(ExchangeError::Timeout {
                                    peer: pair.peer,
                                    attempts: pair.attempts,
                                });
                            }
                            std::thread::sleep(self.poll_interval);
                            all_done = false;
                        }
                    }
                }
                PairPhase::Transfer => {
                    let link = pair.link.as_mut().expect("linked pair");
                    // servers push first, clients drain first; both sides
                    // agree on the order so the stream never deadlocks
                    if pair.server {
                        if !self.self_skipped {
                            send_slots(driver, link, &self.slots)?;
                        }
                        if !pair.peer_skipped {
                            recv_slots(driver, link, &self.slots, pair.peer, registry)?;
                        }
                    } else {
                        if !pair.peer_skipped {
                            recv_slots(driver, link, &self.slots, pair.peer, registry)?;
                        }
                        if !self.self_skipped {
                            send_slots(driver, link, &self.slots)?;
                        }
                    }
                    pair.link = None;
                    pair.phase = PairPhase::Done;
                }
                PairPhase::Done => {}
            }
        }
        if all_done && !self.torn_down {
            self.transport.teardown()?;
            self.torn_down = true;
        }
        Ok(all_done && self.torn_down)
    }

    /// Blocking convenience used by setup-time callers and tests.
    pub fn run_to_completion(
        &mut self,
        driver: &dyn DeviceDriver,
        registry: &mut HandleRegistry,
    ) -> Result<(), ExchangeError> {
        loop {
            if self.progress(driver, registry)? {
                return Ok(());
            }
        }
    }
}

fn send_slots<L: HandleLink>(
    driver: &dyn DeviceDriver,
    link: &mut L,
    slots: &[BufferSlot],
) -> Result<(), ExchangeError> {
    for slot in slots {
        let fd = driver.export_memory_handle(slot.ptr)?;
        link.send_fd(fd.as_fd())?;
    }
    Ok(())
}

fn recv_slots<L: HandleLink>(
    driver: &dyn DeviceDriver,
    link: &mut L,
    slots: &[BufferSlot],
    peer: usize,
    registry: &mut HandleRegistry,
) -> Result<(), ExchangeError> {
    for (idx, slot) in slots.iter().enumerate() {
        let fd = link.recv_fd()?;
        let ptr = driver.import_memory_handle(fd)?;
        // ring peers share the slot layout, so the local offset applies
        registry.insert(
            peer,
            idx,
            PeerMemoryHandle {
                ptr,
                offset: slot.offset,
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use nix::unistd::dup;
    use std::os::fd::{FromRawFd, RawFd};

    struct ChanLink {
        tx: Sender<RawFd>,
        rx: Receiver<RawFd>,
    }

    impl HandleLink for ChanLink {
        fn send_fd(&mut self, fd: BorrowedFd) -> Result<(), ExchangeError> {
            use std::os::fd::AsRawFd;
            let duped = dup(fd.as_raw_fd())
                .map_err(|e| ExchangeError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
            self.tx
                .send(duped)
                .map_err(|_| ExchangeError::ShortTransfer)
        }

        fn recv_fd(&mut self) -> Result<OwnedFd, ExchangeError> {
            let raw = self
                .rx
                .recv_timeout(Duration::from_secs(1))
                .map_err(|_| ExchangeError::ShortTransfer)?;
            Ok(unsafe { OwnedFd::from_raw_fd(raw) })
        }
    }

    /// Transport that yields a pre-wired link after a configured number of
    /// failed attempts, or never.
    struct ScriptedTransport {
        accept_after: u32,
        seen: u32,
        link: Option<ChanLink>,
        torn_down: bool,
    }

    impl RendezvousTransport for ScriptedTransport {
        type Link = ChanLink;

        fn try_accept(&mut self, peer: usize) -> Result<Option<ChanLink>, ExchangeError> {
            self.try_connect(peer)
        }

        fn try_connect(&mut self, _peer: usize) -> Result<Option<ChanLink>, ExchangeError> {
            self.seen += 1;
            if self.seen >= self.accept_after {
                Ok(self.link.take())
            } else {
                Ok(None)
            }
        }

        fn teardown(&mut self) -> Result<(), ExchangeError> {
            self.torn_down = true;
            Ok(())
        }
    }

    fn wired_pair() -> (ChanLink, ChanLink) {
        let (tx_a, rx_b) = unbounded();
        let (tx_b, rx_a) = unbounded();
        (
            ChanLink { tx: tx_a, rx: rx_a },
            ChanLink { tx: tx_b, rx: rx_b },
        )
    }

    #[test]
    fn two_peers_exchange_one_slot() {
        let driver = FakeDriver::new();
        let (link0, link1) = wired_pair();
        let t0 = ScriptedTransport {
            accept_after: 1,
            seen: 0,
            link: Some(link0),
            torn_down: false,
        };
        let t1 = ScriptedTransport {
            accept_after: 1,
            seen: 0,
            link: Some(link1),
            torn_down: false,
        };
        let slots0 = vec![BufferSlot {
            ptr: DevicePtr(0x1000),
            offset: 0,
        }];
        let slots1 = vec![BufferSlot {
            ptr: DevicePtr(0x2000),
            offset: 0,
        }];
        let peers0 = [PeerSpec {
            rank: 1,
            skipped: false,
        }];
        let peers1 = [PeerSpec {
            rank: 0,
            skipped: false,
        }];
        let interval = Duration::from_millis(1);
        let mut s0 = ExchangeSession::new(t0, 0, &peers0, slots0, false, 10, interval);
        let mut s1 = ExchangeSession::new(t1, 1, &peers1, slots1, false, 10, interval);

        // each side blocks draining the other, so drive them on two threads
        let driver = std::sync::Arc::new(driver);
        let driver1 = std::sync::Arc::clone(&driver);
        let peer = std::thread::spawn(move || {
            let mut r1 = HandleRegistry::new();
            s1.run_to_completion(driver1.as_ref(), &mut r1).unwrap();
            r1
        });
        let mut r0 = HandleRegistry::new();
        s0.run_to_completion(driver.as_ref(), &mut r0).unwrap();
        let r1 = peer.join().unwrap();

        assert_eq!(r0.len(), 1);
        assert_eq!(r1.len(), 1);
        assert_eq!(r0.get(1, 0).unwrap().ptr, DevicePtr(0x2000));
        assert_eq!(r1.get(0, 0).unwrap().ptr, DevicePtr(0x1000));
    }

    #[test]
    fn retry_budget_exhaustion_is_fatal() {
        let driver = FakeDriver::new();
        let transport = ScriptedTransport {
            accept_after: u32::MAX,
            seen: 0,
            link: None,
            torn_down: false,
        };
        let peers = [PeerSpec {
            rank: 1,
            skipped: false,
        }];
        let mut session =
            ExchangeSession::new(transport, 0, &peers, Vec::new(), false, 5, Duration::ZERO);
        let mut registry = HandleRegistry::new();
        let mut last = Ok(false);
        for _ in 0..10 {
            last = session.progress(&driver, &mut registry);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(
            last,
            Err(ExchangeError::Timeout { peer: 1, attempts: 5 })
        ));
    }

    #[test]
    fn skip_marked_peer_leaves_slots_absent() {
        let driver = FakeDriver::new();
        let (link0, link1) = wired_pair();
        let t0 = ScriptedTransport {
            accept_after: 1,
            seen: 0,
            link: Some(link0),
            torn_down: false,
        };
        let t1 = ScriptedTransport {
            accept_after: 1,
            seen: 0,
            link: Some(link1),
            torn_down: false,
        };
        let slots = vec![BufferSlot {
            ptr: DevicePtr(0x3000),
            offset: 64,
        }];
        // peer 1 is skip-marked: rank 0 sends but expects nothing back
        let peers0 = [PeerSpec {
            rank: 1,
            skipped: true,
        }];
        let peers1 = [PeerSpec {
            rank: 0,
            skipped: false,
        }];
        let interval = Duration::from_millis(1);
        let mut s0 = ExchangeSession::new(t0, 0, &peers0, slots.clone(), false, 10, interval);
        let mut s1 = ExchangeSession::new(t1, 1, &peers1, slots, true, 10, interval);
        let mut r0 = HandleRegistry::new();
        let mut r1 = HandleRegistry::new();
        while !s0.progress(&driver, &mut r0).unwrap() {}
        while !s1.progress(&driver, &mut r1).unwrap() {}
        assert!(r0.is_empty());
        assert_eq!(r1.len(), 1);
        assert_eq!(r1.get(0, 0).unwrap().offset, 64);
    }
}
