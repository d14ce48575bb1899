use super::{Entry, EntryError, EntryStatus};
use crate::sched::{BufPtr, SchedContext};

/// Host-side buffer copy. `src` and `dst` must not overlap unless they
/// alias exactly, in which case the copy is skipped.
pub struct CopyEntry {
    src: BufPtr,
    dst: BufPtr,
    status: EntryStatus,
}

impl CopyEntry {
    pub fn new(src: BufPtr, dst: BufPtr) -> Self {
        assert_eq!(src.len(), dst.len());
        CopyEntry {
            src,
            dst,
            status: EntryStatus::NotStarted,
        }
    }
}

impl Entry for CopyEntry {
    fn name(&self) -> &'static str {
        "COPY"
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

    fn update(&mut self, _ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::Started {
            return Ok(());
        }
        if self.src.as_ptr() != self.dst.as_ptr() && !self.src.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(self.src.as_ptr(), self.dst.as_ptr(), self.src.len());
            }
        }
        self.status = EntryStatus::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::host_context;

    #[test]
    fn copies_bytes() {
        let mut ctx = host_context(1);
        let mut src = vec![1u8, 2, 3, 4];
        let mut dst = vec![0u8; 4];
        let mut entry = CopyEntry::new(
            BufPtr::from_slice(&mut src),
            BufPtr::from_slice(&mut dst),
        );
        entry.start(&mut ctx).unwrap();
        entry.update(&mut ctx).unwrap();
        assert_eq!(entry.status(), EntryStatus::Complete);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn aliasing_copy_is_a_no_op() {
        let mut ctx = host_context(1);
        let mut buf = vec![9u8; 8];
        let ptr = BufPtr::from_slice(&mut buf);
        let mut entry = CopyEntry::new(ptr, ptr);
        entry.start(&mut ctx).unwrap();
        entry.update(&mut ctx).unwrap();
        assert_eq!(entry.status(), EntryStatus::Complete);
    }
}
