use super::{Entry, EntryError, EntryStatus};
use crate::sched::SchedContext;

/// One round of a rank synchronization: a zero-byte token to one peer, a
/// zero-byte token from another. Barrier schedules chain these.
pub struct SyncEntry {
    send_peer: usize,
    recv_peer: usize,
    tag: u64,
    status: EntryStatus,
}

impl SyncEntry {
    pub fn new(send_peer: usize, recv_peer: usize, tag: u64) -> Self {
        SyncEntry {
            send_peer,
            recv_peer,
            tag,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for SyncEntry {
    fn name(&self) -> &'static str {
        "SYNC"
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn reset(&mut self) {
        self.status = EntryStatus::NotStarted;
    }

    fn start(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::NotStarted {
            return Err(EntryError::BadStart(self.status));
        }
        ctx.endpoint.post_send(self.send_peer, self.tag, &[])?;
        self.status = EntryStatus::Started;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        let mut empty = [0u8; 0];
        if ctx.endpoint.try_recv(self.recv_peer, self.tag, &mut empty)? {
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }
}
