//! Schedules: the ordered set of asynchronous steps realizing one
//! collective call. Entries start in declaration order within a stage and
//! may be in flight concurrently; a barrier between stages gates the next
//! stage on completion of everything before it. A schedule marked
//! cacheable transfers into the fingerprint-keyed schedule cache on
//! completion and is re-armed on the next structurally identical call.

pub mod build;
pub mod entry;

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::cache::ResourceCache;
use crate::coll::{CollType, DataType, ReduceOp};
use crate::comm::{Communicator, CommunicatorId};
use crate::config::RendezvousConfig;
use crate::driver::{ContextId, DeviceDriver, DeviceId, DevicePtr};
use crate::engine::LaunchLimiter;
use crate::exchange::HandleRegistry;
use crate::selection::{Algorithm, BufferPlacement, SelectionError};
use crate::transport::Endpoint;

use entry::{Entry, EntryError, EntryStatus};

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("entry '{name}' failed: {source}")]
    Entry {
        name: &'static str,
        #[source]
        source: EntryError,
    },
    #[error("algorithm '{algo}' is not implemented for {coll:?} on this topology")]
    NotImplemented {
        coll: CollType,
        algo: &'static str,
    },
    #[error("schedule is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// Raw buffer reference handed to entries. The caller guarantees the
/// allocation outlives the schedule and that the collective's write
/// discipline (one writer per destination region per step) holds.
#[derive(Clone, Copy, Debug)]
pub struct BufPtr {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BufPtr {}
unsafe impl Sync for BufPtr {}

impl BufPtr {
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        assert!(!ptr.is_null() || len == 0);
        BufPtr { ptr, len }
    }

    pub fn empty() -> Self {
        BufPtr {
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: 0,
        }
    }

    pub fn from_slice(slice: &mut [u8]) -> Self {
        BufPtr {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr as u64)
    }

    /// Sub-range in bytes; panics on out-of-bounds.
    pub fn byte_range(&self, offset: usize, len: usize) -> BufPtr {
        assert!(offset + len <= self.len);
        BufPtr {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    /// Caller guarantees exclusive access per the schedule's ordering.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// Caller guarantees exclusive access per the schedule's ordering.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Shared per-call context: buffers' datatype and operator, the transport
/// endpoint, the device plumbing, and the peer handle registry.
pub struct SchedContext {
    pub comm: Communicator,
    pub endpoint: Box<dyn Endpoint>,
    pub driver: Arc<dyn DeviceDriver>,
    pub cache: Arc<ResourceCache>,
    pub launcher: Arc<LaunchLimiter>,
    pub rendezvous: RendezvousConfig,
    pub handles: HandleRegistry,
    pub worker: usize,
    pub device: DeviceId,
    pub device_context: ContextId,
    pub dtype: DataType,
    pub op: Option<ReduceOp>,
    pub placement: BufferPlacement,
    pub cacheable: bool,
    scratch: Vec<Box<[u8]>>,
}

impl SchedContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Communicator,
        endpoint: Box<dyn Endpoint>,
        driver: Arc<dyn DeviceDriver>,
        cache: Arc<ResourceCache>,
        launcher: Arc<LaunchLimiter>,
        rendezvous: RendezvousConfig,
        worker: usize,
        device: DeviceId,
        device_context: ContextId,
        dtype: DataType,
        op: Option<ReduceOp>,
        placement: BufferPlacement,
        cacheable: bool,
    ) -> Self {
        SchedContext {
            comm,
            endpoint,
            driver,
            cache,
            launcher,
            rendezvous,
            handles: HandleRegistry::new(),
            worker,
            device,
            device_context,
            dtype,
            op,
            placement,
            cacheable,
            scratch: Vec::new(),
        }
    }

    /// Allocates call-lifetime scratch storage. The boxed slice never
    /// moves, so the returned pointer stays valid until the schedule is
    /// dropped.
    pub fn alloc_scratch(&mut self, bytes: usize) -> BufPtr {
        let mut block = vec![0u8; bytes].into_boxed_slice();
        let ptr = BufPtr::new(block.as_mut_ptr(), bytes);
        self.scratch.push(block);
        ptr
    }
}

/// Structural identity of a cacheable schedule. Operand addresses are
/// part of the key: entries bake buffer pointers in at build time, so a
/// cached schedule is only valid for calls on the same operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleFingerprint {
    pub coll: CollType,
    pub count: usize,
    pub dtype: DataType,
    pub op: Option<ReduceOp>,
    pub algo: Algorithm,
    pub placement: BufferPlacement,
    pub comm: CommunicatorId,
    pub send_buf: u64,
    pub recv_buf: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Running,
    Done,
    Failed,
}

struct StagedEntry {
    stage: u32,
    entry: Box<dyn Entry>,
}

pub struct Schedule {
    entries: Vec<StagedEntry>,
    ctx: SchedContext,
    state: ScheduleState,
    current_stage: u32,
    num_stages: u32,
    fingerprint: Option<ScheduleFingerprint>,
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("entries", &self.entries.len())
            .field("state", &self.state)
            .field("current_stage", &self.current_stage)
            .field("num_stages", &self.num_stages)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Schedule {
    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn fingerprint(&self) -> Option<&ScheduleFingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn is_cacheable(&self) -> bool {
        self.fingerprint.is_some()
    }

    pub fn context(&self) -> &SchedContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SchedContext {
        &mut self.ctx
    }

    /// Prepare for (re-)execution. At most one live execution at a time.
    pub(crate) fn arm(&mut self) -> Result<(), SchedError> {
        if self.state == ScheduleState::Running {
            return Err(SchedError::AlreadyRunning);
        }
        for se in self.entries.iter_mut() {
            se.entry.reset();
        }
        self.current_stage = 0;
        self.state = ScheduleState::Running;
        Ok(())
    }

    /// One cooperative pass: start eligible entries of the current stage
    /// in declaration order, poll the in-flight ones, advance the stage
    /// when it drains. Returns true when the whole schedule is complete.
    pub(crate) fn progress(&mut self) -> Result<bool, SchedError> {
        if self.state != ScheduleState::Running {
            return Ok(self.state == ScheduleState::Done);
        }
        while self.current_stage < self.num_stages {
            let stage = self.current_stage;
            let ctx = &mut self.ctx;
            let mut stage_complete = true;
            for se in self.entries.iter_mut().filter(|se| se.stage == stage) {
                let step = match se.entry.status() {
                    EntryStatus::NotStarted => se.entry.start(ctx),
                    EntryStatus::Started | EntryStatus::Again => se.entry.update(ctx),
                    EntryStatus::Complete => Ok(()),
                    EntryStatus::Failed => Ok(()),
                };
                if let Err(source) = step {
                    self.state = ScheduleState::Failed;
                    return Err(SchedError::Entry {
                        name: se.entry.name(),
                        source,
                    });
                }
                if se.entry.status() != EntryStatus::Complete {
                    stage_complete = false;
                }
            }
            if !stage_complete {
                return Ok(false);
            }
            self.current_stage += 1;
        }
        if !self.ctx.cacheable {
            let ctx = &mut self.ctx;
            for se in self.entries.iter_mut().filter(|se| se.entry.is_gpu()) {
                if let Err(source) = se.entry.finalize(ctx) {
                    self.state = ScheduleState::Failed;
                    return Err(SchedError::Entry {
                        name: se.entry.name(),
                        source,
                    });
                }
            }
        }
        self.state = ScheduleState::Done;
        Ok(true)
    }
}

/// Assembles a schedule stage by stage, in the order entries will issue.
pub struct ScheduleBuilder {
    entries: Vec<StagedEntry>,
    stage: u32,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        ScheduleBuilder {
            entries: Vec::new(),
            stage: 0,
        }
    }

    pub fn add(&mut self, entry: Box<dyn Entry>) {
        self.entries.push(StagedEntry {
            stage: self.stage,
            entry,
        });
    }

    /// Entries added after the barrier wait for everything before it.
    pub fn add_barrier(&mut self) {
        if self.entries.iter().any(|se| se.stage == self.stage) {
            self.stage += 1;
        }
    }

    pub fn build(self, ctx: SchedContext, fingerprint: Option<ScheduleFingerprint>) -> Schedule {
        let num_stages = self.entries.iter().map(|se| se.stage + 1).max().unwrap_or(0);
        Schedule {
            entries: self.entries,
            ctx,
            state: ScheduleState::Idle,
            current_stage: 0,
            num_stages,
            fingerprint,
        }
    }
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Completed cacheable schedules, keyed by structural fingerprint.
/// Checkout removes the schedule so a given instance has at most one live
/// execution.
pub struct ScheduleCache {
    inner: DashMap<ScheduleFingerprint, Schedule>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        ScheduleCache {
            inner: DashMap::new(),
        }
    }

    pub fn checkout(&self, fingerprint: &ScheduleFingerprint) -> Option<Schedule> {
        self.inner.remove(fingerprint).map(|(_, sched)| sched)
    }

    pub fn insert(&self, schedule: Schedule) {
        if let Some(fp) = schedule.fingerprint {
            self.inner.insert(fp, schedule);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ScheduleCache {
    fn default() -> Self {
        Self::new()
    }
}
