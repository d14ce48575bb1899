//! Schedule entries: the unit of asynchronous work. An entry is a small
//! state machine driven by the engine's polling loop:
//!
//! `NotStarted -> Started -> (Again -> Started)* -> Complete`
//!
//! `start` issues the underlying operation and must not block on its
//! completion; `update` is a non-blocking poll; `Again` means the entry
//! lost a shared execution slot and will retry on the next drive. A fatal
//! error aborts the owning schedule.

mod copy;
mod handle_exchange;
mod kernel;
mod nop;
mod recv;
mod recv_reduce;
mod send;
mod sync;

pub use copy::CopyEntry;
pub use handle_exchange::HandleExchangeEntry;
pub use kernel::KernelEntry;
pub use nop::NopEntry;
pub use recv::RecvEntry;
pub use recv_reduce::RecvReduceEntry;
pub use send::SendEntry;
pub use sync::SyncEntry;

use thiserror::Error;

use crate::comp::CompError;
use crate::driver::DriverError;
use crate::exchange::ExchangeError;
use crate::transport::TransportError;

use super::SchedContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    NotStarted,
    Started,
    Again,
    Complete,
    Failed,
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Comp(#[from] CompError),
    #[error("entry was started while in state {0:?}")]
    BadStart(EntryStatus),
    #[error("reduction entry without a reduction operator")]
    MissingReduceOp,
    #[error("peer memory handle missing for rank {rank} slot {slot}")]
    MissingHandle { rank: usize, slot: usize },
}

pub trait Entry: Send + Sync {
    fn name(&self) -> &'static str;

    fn status(&self) -> EntryStatus;

    /// Back to `NotStarted` so a cached schedule can be re-armed.
    fn reset(&mut self);

    /// Acquire resources and issue the asynchronous operation.
    fn start(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError>;

    /// Poll for completion; a no-op once `Complete`.
    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError>;

    /// Return cached resources. Only meaningful for GPU entries; invoked
    /// on completion unless the owning schedule is cacheable.
    fn finalize(&mut self, _ctx: &mut SchedContext) -> Result<(), EntryError> {
        Ok(())
    }

    fn is_gpu(&self) -> bool {
        false
    }
}
