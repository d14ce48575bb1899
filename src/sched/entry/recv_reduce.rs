use super::{Entry, EntryError, EntryStatus};
use crate::comp;
use crate::sched::{BufPtr, SchedContext};

/// Waits for one incoming message and folds it into the destination
/// buffer with the call's reduction operator.
pub struct RecvReduceEntry {
    peer: usize,
    tag: u64,
    dst: BufPtr,
    scratch: Vec<u8>,
    status: EntryStatus,
}

impl RecvReduceEntry {
    pub fn new(peer: usize, tag: u64, dst: BufPtr) -> Self {
        RecvReduceEntry {
            peer,
            tag,
            scratch: vec![0u8; dst.len()],
            dst,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for RecvReduceEntry {
    fn name(&self) -> &'static str {
        "RECV_REDUCE"
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
        if ctx.op.is_none() {
            return Err(EntryError::MissingReduceOp);
        }
        self.status = EntryStatus::Started;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        if ctx
            .endpoint
            .try_recv(self.peer, self.tag, &mut self.scratch)?
        {
            let op = ctx.op.ok_or(EntryError::MissingReduceOp)?;
            let dst = unsafe { self.dst.as_mut_slice() };
            comp::reduce_into(ctx.dtype, op, dst, &self.scratch)?;
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }
}
