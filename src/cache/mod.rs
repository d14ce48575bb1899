//! Cache of expensive-to-create device execution objects. Acquire/release
//! is an exclusive-checkout discipline keyed by (worker, device, context,
//! descriptor): an object handed out by `acquire` is owned by exactly one
//! entry until `release` returns it. The bookkeeping map sits behind a
//! single mutex held only around the lookup/insert; driver calls are
//! issued outside the critical section.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::coll::CollType;
use crate::driver::{
    ContextId, DeviceDriver, DeviceId, DriverError, FenceDesc, FenceHandle, KernelHandle,
    ListDesc, ListHandle, ModuleHandle, QueueDesc, QueueHandle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDesc {
    Queue(QueueDesc),
    List(ListDesc),
    /// Fences are bound to the queue they were created against.
    Fence(QueueHandle, FenceDesc),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceHandle {
    Queue(QueueHandle),
    List(ListHandle),
    Fence(FenceHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ResourceKey {
    worker: usize,
    device: DeviceId,
    context: ContextId,
    desc: ResourceDesc,
}

#[derive(Default)]
struct CacheInner {
    pool: HashMap<ResourceKey, Vec<ResourceHandle>>,
    // creation order, for LIFO teardown
    created: Vec<ResourceHandle>,
}

#[derive(Default)]
struct ModuleInner {
    modules: HashMap<(DeviceId, ContextId, &'static str), ModuleHandle>,
    kernels: HashMap<(ModuleHandle, String), KernelHandle>,
    // load order, for teardown after queues/lists/fences
    loaded: Vec<ModuleHandle>,
}

pub struct ResourceCache {
    driver: Arc<dyn DeviceDriver>,
    kernels_dir: PathBuf,
    inner: Mutex<CacheInner>,
    programs: Mutex<ModuleInner>,
}

/// Kernel image file per collective kind. Kinds without a device kernel
/// have no image and cannot take the GPU path.
fn module_file_name(coll: CollType) -> Option<&'static str> {
    match coll {
        CollType::Allreduce => Some("ring_allreduce.spv"),
        CollType::Allgatherv => Some("ring_allgatherv.spv"),
        CollType::Broadcast => Some("ring_bcast.spv"),
        CollType::Reduce => Some("ring_reduce.spv"),
        CollType::ReduceScatter => Some("ring_reduce_scatter.spv"),
        _ => None,
    }
}

impl ResourceCache {
    pub fn new(driver: Arc<dyn DeviceDriver>, kernels_dir: PathBuf) -> Self {
        ResourceCache {
            driver,
            kernels_dir,
            inner: Mutex::new(CacheInner::default()),
            programs: Mutex::new(ModuleInner::default()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn acquire(
        &self,
        worker: usize,
        device: DeviceId,
        context: ContextId,
        desc: ResourceDesc,
    ) -> Result<ResourceHandle, DriverError> {
        let key = ResourceKey {
            worker,
            device,
            context,
            desc,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(pool) = inner.pool.get_mut(&key) {
                if let Some(handle) = pool.pop() {
                    log::debug!("resource cache hit: worker {} {:?}", worker, desc);
                    return Ok(handle);
                }
            }
        }
        log::debug!("resource cache miss: worker {} {:?}", worker, desc);
        let handle = match desc {
            ResourceDesc::Queue(d) => {
                ResourceHandle::Queue(self.driver.create_queue(device, context, &d)?)
            }
            ResourceDesc::List(d) => {
                ResourceHandle::List(self.driver.create_command_list(device, context, &d)?)
            }
            ResourceDesc::Fence(queue, d) => {
                ResourceHandle::Fence(self.driver.create_fence(queue, &d)?)
            }
        };
        self.inner.lock().unwrap().created.push(handle);
        Ok(handle)
    }

    pub fn release(
        &self,
        worker: usize,
        device: DeviceId,
        context: ContextId,
        desc: ResourceDesc,
        handle: ResourceHandle,
    ) {
        let key = ResourceKey {
            worker,
            device,
            context,
            desc,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.pool.entry(key).or_default().push(handle);
    }

    /// Lazily loads the kernel image for `coll` once per (device, context)
    /// and shares it across all workers.
    pub fn get_module(
        &self,
        device: DeviceId,
        context: ContextId,
        coll: CollType,
    ) -> Result<ModuleHandle, DriverError> {
        let file = module_file_name(coll)
            .ok_or_else(|| DriverError::ModuleNotFound(coll.name().to_owned()))?;
        let key = (device, context, file);
        if let Some(module) = self.programs.lock().unwrap().modules.get(&key) {
            return Ok(*module);
        }
        // load outside the lock; a racing load keeps the first insert
        let path = self.kernels_dir.join(file);
        let module = self.driver.load_module(device, context, &path)?;
        let mut programs = self.programs.lock().unwrap();
        if let Some(existing) = programs.modules.get(&key) {
            let existing = *existing;
            drop(programs);
            self.driver.destroy_module(module)?;
            return Ok(existing);
        }
        programs.modules.insert(key, module);
        programs.loaded.push(module);
        log::debug!("loaded kernel image {} for {:?}", file, device);
        Ok(module)
    }

    pub fn get_kernel(
        &self,
        module: ModuleHandle,
        name: &str,
    ) -> Result<KernelHandle, DriverError> {
        let key = (module, name.to_owned());
        if let Some(kernel) = self.programs.lock().unwrap().kernels.get(&key) {
            return Ok(*kernel);
        }
        let kernel = self.driver.create_kernel(module, name)?;
        let mut programs = self.programs.lock().unwrap();
        if let Some(existing) = programs.kernels.get(&key) {
            return Ok(*existing);
        }
        programs.kernels.insert(key, kernel);
        Ok(kernel)
    }

    /// Destroys every pooled object: queues/lists/fences in reverse
    /// creation order first, program images after them. Outstanding
    /// checkouts must have been released before teardown.
    pub fn teardown(&self) -> Result<(), DriverError> {
        let created = {
            let mut inner = self.inner.lock().unwrap();
            inner.pool.clear();
            std::mem::take(&mut inner.created)
        };
        for handle in created.into_iter().rev() {
            match handle {
                ResourceHandle::Fence(f) => self.driver.destroy_fence(f)?,
                ResourceHandle::List(l) => self.driver.destroy_command_list(l)?,
                ResourceHandle::Queue(q) => self.driver.destroy_queue(q)?,
            }
        }
        let loaded = {
            let mut programs = self.programs.lock().unwrap();
            programs.modules.clear();
            programs.kernels.clear();
            std::mem::take(&mut programs.loaded)
        };
        for module in loaded.into_iter().rev() {
            self.driver.destroy_module(module)?;
        }
        Ok(())
    }
}
