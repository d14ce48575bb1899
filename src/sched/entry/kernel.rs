use super::{Entry, EntryError, EntryStatus};
use crate::cache::{ResourceDesc, ResourceHandle};
use crate::coll::CollType;
use crate::driver::{FenceDesc, FenceHandle, FenceStatus, GroupCount, KernelHandle, ListDesc, ListHandle, QueueDesc, QueueHandle};
use crate::sched::SchedContext;

/// Launches a device kernel through cached execution objects and polls its
/// fence. Launch admission goes through the worker's launch limiter: a
/// lost race reports `Again` and retries on the next drive instead of
/// blocking the loop.
pub struct KernelEntry {
    coll: CollType,
    kernel_name: String,
    group_count: GroupCount,
    /// (peer rank, slot) pairs the kernel dereferences; checked against
    /// the handle registry before launch.
    required_handles: Vec<(usize, usize)>,

    queue: Option<QueueHandle>,
    list: Option<ListHandle>,
    fence: Option<FenceHandle>,
    kernel: Option<KernelHandle>,
    launched: bool,
    claimed: bool,
    status: EntryStatus,
}

impl KernelEntry {
    pub fn new(
        coll: CollType,
        kernel_name: String,
        group_count: GroupCount,
        required_handles: Vec<(usize, usize)>,
    ) -> Self {
        KernelEntry {
            coll,
            kernel_name,
            group_count,
            required_handles,
            queue: None,
            list: None,
            fence: None,
            kernel: None,
            launched: false,
            claimed: false,
            status: EntryStatus::NotStarted,
        }
    }

    fn acquire_resources(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.queue.is_none() {
            let handle = ctx.cache.acquire(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::Queue(QueueDesc::default()),
            )?;
            self.queue = Some(match handle {
                ResourceHandle::Queue(q) => q,
                _ => unreachable!(),
            });
        }
        if self.list.is_none() {
            let handle = ctx.cache.acquire(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::List(ListDesc::default()),
            )?;
            self.list = Some(match handle {
                ResourceHandle::List(l) => l,
                _ => unreachable!(),
            });
        }
        if self.fence.is_none() {
            let queue = self.queue.expect("queue acquired above");
            let handle = ctx.cache.acquire(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::Fence(queue, FenceDesc),
            )?;
            self.fence = Some(match handle {
                ResourceHandle::Fence(f) => f,
                _ => unreachable!(),
            });
        }
        if self.kernel.is_none() {
            let module = ctx
                .cache
                .get_module(ctx.device, ctx.device_context, self.coll)?;
            self.kernel = Some(ctx.cache.get_kernel(module, &self.kernel_name)?);
        }
        Ok(())
    }

    fn try_launch(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if !ctx.launcher.try_claim() {
            self.status = EntryStatus::Again;
            return Ok(());
        }
        self.claimed = true;
        let queue = self.queue.expect("resources acquired");
        let list = self.list.expect("resources acquired");
        let fence = self.fence.expect("resources acquired");
        let kernel = self.kernel.expect("resources acquired");
        ctx.driver.launch_kernel(list, kernel, self.group_count)?;
        ctx.driver.reset_fence(fence)?;
        ctx.driver.execute_command_lists(queue, &[list], Some(fence))?;
        self.launched = true;
        self.status = EntryStatus::Started;
        log::trace!(
            "rank {} launched {} on worker {}",
            ctx.comm.rank(),
            self.kernel_name,
            ctx.worker
        );
        Ok(())
    }
}

impl Entry for KernelEntry {
    fn name(&self) -> &'static str {
        "KERNEL"
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn reset(&mut self) {
        self.launched = false;
        self.claimed = false;
        self.status = EntryStatus::NotStarted;
    }

    fn start(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status != EntryStatus::NotStarted {
            return Err(EntryError::BadStart(self.status));
        }
        for &(rank, slot) in &self.required_handles {
            if ctx.handles.get(rank, slot).is_none() {
                return Err(EntryError::MissingHandle { rank, slot });
            }
        }
        self.acquire_resources(ctx)?;
        self.try_launch(ctx)
    }

    fn update(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if self.status == EntryStatus::Complete {
            return Ok(());
        }
        if !self.launched {
            // lost the admission race earlier
            self.try_launch(ctx)?;
            if !self.launched {
                return Ok(());
            }
        }
        let fence = self.fence.expect("launched entry has a fence");
        match ctx.driver.query_fence(fence)? {
            FenceStatus::Ready => {
                if self.claimed {
                    ctx.launcher.release();
                    self.claimed = false;
                }
                self.status = EntryStatus::Complete;
            }
            FenceStatus::Pending => {}
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &mut SchedContext) -> Result<(), EntryError> {
        if let Some(fence) = self.fence.take() {
            let queue = self.queue.expect("fence implies queue");
            ctx.driver.reset_fence(fence)?;
            ctx.cache.release(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::Fence(queue, FenceDesc),
                ResourceHandle::Fence(fence),
            );
        }
        if let Some(list) = self.list.take() {
            ctx.cache.release(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::List(ListDesc::default()),
                ResourceHandle::List(list),
            );
        }
        if let Some(queue) = self.queue.take() {
            ctx.cache.release(
                ctx.worker,
                ctx.device,
                ctx.device_context,
                ResourceDesc::Queue(QueueDesc::default()),
                ResourceHandle::Queue(queue),
            );
        }
        self.kernel = None;
        Ok(())
    }

    fn is_gpu(&self) -> bool {
        true
    }
}
