use super::{Entry, EntryError, EntryStatus};
use crate::sched::SchedContext;

/// Placeholder step; completes on the first poll.
pub struct NopEntry {
    status: EntryStatus,
}

impl NopEntry {
    pub fn new() -> Self {
        NopEntry {
            status: EntryStatus::NotStarted,
        }
    }
}

impl Default for NopEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Entry for NopEntry {
    fn name(&self) -> &'static str {
        "NOP"
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
        if self.status == EntryStatus::Started {
            self.status = EntryStatus::Complete;
        }
        Ok(())
    }
}
