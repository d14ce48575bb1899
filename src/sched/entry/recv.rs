use super::{Entry, EntryError, EntryStatus};
use crate::sched::{BufPtr, SchedContext};

/// Waits for one incoming message and copies it into the buffer.
pub struct RecvEntry {
    peer: usize,
    tag: u64,
    buf: BufPtr,
    status: EntryStatus,
}

impl RecvEntry {
    pub fn new(peer: usize, tag: u64, buf: BufPtr) -> Self {
        RecvEntry {
            peer,
            tag,
            buf,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for RecvEntry {
    fn name(&self) -> &'static str {
        "RECV"
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn reset(&mut self) {
        self.status = EntryStatus::NotStarted;
    }

    fn start(&mut self, _ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::NotStarted {
            return Err(EntryError::BadStart(self.status));
        }
        self.status = EntryStatus::Started;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        let buf = unsafe { self.buf.as_mut_slice() };
        if ctx.endpoint.try_recv(self.peer, self.tag, buf)? {
            log::trace!(
                "rank {} recv {} bytes from {} tag {:#x}",
                ctx.comm.rank(),
                self.buf.len(),
                self.peer,
                self.tag
            );
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }
}
