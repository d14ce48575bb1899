use super::{Entry, EntryError, EntryStatus};
use crate::sched::{BufPtr, SchedContext};

/// Posts one outgoing message to a peer. The payload is captured when the
/// entry starts; later writes to the buffer do not affect the message.
pub struct SendEntry {
    peer: usize,
    tag: u64,
    buf: BufPtr,
    status: EntryStatus,
}

impl SendEntry {
    pub fn new(peer: usize, tag: u64, buf: BufPtr) -> Self {
        SendEntry {
            peer,
            tag,
            buf,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for SendEntry {
    fn name(&self) -> &'static str {
        "SEND"
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
        log::trace!(
            "rank {} send {} bytes to {} tag {:#x}",
            ctx.comm.rank(),
            self.buf.len(),
            self.peer,
            self.tag
        );
        let data = unsafe { self.buf.as_slice() };
        ctx.endpoint.post_send(self.peer, self.tag, data)?;
        self.status = EntryStatus::Started;
        Ok(())
    }

    fn update(&mut self, _ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status == EntryStatus::Started {
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }
}
