use super::{Entry, EntryError, EntryStatus};
use crate::exchange::rendezvous::{BufferSlot, ExchangeSession, PeerSpec};
use crate::exchange::socket::UnixRendezvous;
use crate::sched::SchedContext;

/// Drives the device-memory handle exchange with the ring neighbors. The
/// rendezvous runs cooperatively: every poll makes one connection attempt
/// per unlinked pair, so the bounded retry budget maps onto the engine's
/// progress loop instead of blocking it.
pub struct HandleExchangeEntry {
    scope: String,
    slots: Vec<BufferSlot>,
    peers: Vec<PeerSpec>,
    self_skipped: bool,
    session: Option<ExchangeSession<UnixRendezvous>>,
    status: EntryStatus,
}

impl HandleExchangeEntry {
    pub fn new(
        scope: String,
        slots: Vec<BufferSlot>,
        peers: Vec<PeerSpec>,
        self_skipped: bool,
    ) -> Self {
        HandleExchangeEntry {
            scope,
            slots,
            peers,
            self_skipped,
            session: None,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for HandleExchangeEntry {
    fn name(&self) -> &'static str {
        "HANDLE_EXCHANGE"
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn reset(&mut self) {
        self.session = None;
        self.status = EntryStatus::NotStarted;
    }

    fn start(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::NotStarted {
            return Err(EntryError::BadStart(self.status));
        }
        let rank = ctx.comm.rank();
        let peer_ranks: Vec<usize> = self.peers.iter().map(|p| p.rank).collect();
        let transport = UnixRendezvous::new(&ctx.rendezvous, &self.scope, rank, &peer_ranks)?;
        self.session = Some(ExchangeSession::new(
            transport,
            rank,
            &self.peers,
            self.slots.clone(),
            self.self_skipped,
            ctx.rendezvous.max_attempts,
            std::time::Duration::from_millis(ctx.rendezvous.poll_interval_ms),
        ));
        self.status = EntryStatus::Started;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        let session = self.session.as_mut().expect("started entry has a session");
        if session.progress(ctx.driver.as_ref(), &mut ctx.handles)? {
            log::debug!(
                "rank {} handle exchange complete ({} peer handles)",
                ctx.comm.rank(),
                ctx.handles.len()
            );
            self.session = None;
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }

    fn is_gpu(&self) -> bool {
        true
    }
}
