//! In-process stand-in for the vendor driver. Object handles are plain
//! counters tracked in a table; fences become ready after a configurable
//! number of polls; exported memory handles are real file descriptors
//! (memfd) carrying the device address, so the exchange protocol can be
//! exercised end-to-end without hardware.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Mutex;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use super::{
    ContextId, DeviceDriver, DeviceId, DevicePtr, DriverError, FenceDesc, FenceHandle, FenceStatus,
    GroupCount, KernelHandle, ListDesc, ListHandle, ModuleHandle, QueueDesc, QueueHandle,
};

#[derive(Default)]
struct FenceState {
    submitted: bool,
    polls_left: u32,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    queues: HashSet<u64>,
    lists: HashSet<u64>,
    modules: HashMap<u64, String>,
    kernels: HashMap<u64, String>,
    fences: HashMap<u64, FenceState>,
    launches: u64,
    queues_created: u64,
    lists_created: u64,
    fences_created: u64,
    modules_loaded: u64,
    kernels_created: u64,
}

pub struct FakeDriver {
    state: Mutex<FakeState>,
    fence_latency: u32,
}

impl FakeDriver {
    pub fn new() -> Self {
        FakeDriver {
            state: Mutex::new(FakeState::default()),
            fence_latency: 2,
        }
    }

    /// Number of `query_fence` calls before a submitted fence reports ready.
    pub fn with_fence_latency(mut self, polls: u32) -> Self {
        self.fence_latency = polls;
        self
    }

    pub fn queues_created(&self) -> u64 {
        self.state.lock().unwrap().queues_created
    }

    pub fn lists_created(&self) -> u64 {
        self.state.lock().unwrap().lists_created
    }

    pub fn fences_created(&self) -> u64 {
        self.state.lock().unwrap().fences_created
    }

    pub fn modules_loaded(&self) -> u64 {
        self.state.lock().unwrap().modules_loaded
    }

    pub fn kernels_created(&self) -> u64 {
        self.state.lock().unwrap().kernels_created
    }

    pub fn launches(&self) -> u64 {
        self.state.lock().unwrap().launches
    }

    fn alloc_handle(state: &mut FakeState) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for FakeDriver {
    fn create_queue(
        &self,
        _device: DeviceId,
        _context: ContextId,
        _desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.queues.insert(handle);
        state.queues_created += 1;
        Ok(QueueHandle(handle))
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.queues.remove(&queue.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle("destroy_queue"))
        }
    }

    fn create_command_list(
        &self,
        _device: DeviceId,
        _context: ContextId,
        _desc: &ListDesc,
    ) -> Result<ListHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.lists.insert(handle);
        state.lists_created += 1;
        Ok(ListHandle(handle))
    }

    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.lists.remove(&list.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle("destroy_command_list"))
        }
    }

    fn load_module(
        &self,
        _device: DeviceId,
        _context: ContextId,
        image: &Path,
    ) -> Result<ModuleHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state
            .modules
            .insert(handle, image.to_string_lossy().into_owned());
        state.modules_loaded += 1;
        Ok(ModuleHandle(handle))
    }

    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.modules.remove(&module.0).is_some() {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle("destroy_module"))
        }
    }

    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        if !state.modules.contains_key(&module.0) {
            return Err(DriverError::InvalidHandle("create_kernel"));
        }
        let handle = Self::alloc_handle(&mut state);
        state.kernels.insert(handle, name.to_owned());
        state.kernels_created += 1;
        Ok(KernelHandle(handle))
    }

    fn create_fence(
        &self,
        queue: QueueHandle,
        _desc: &FenceDesc,
    ) -> Result<FenceHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains(&queue.0) {
            return Err(DriverError::InvalidHandle("create_fence"));
        }
        let handle = Self::alloc_handle(&mut state);
        state.fences.insert(handle, FenceState::default());
        state.fences_created += 1;
        Ok(FenceHandle(handle))
    }

    fn destroy_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.fences.remove(&fence.0).is_some() {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle("destroy_fence"))
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        match state.fences.get_mut(&fence.0) {
            Some(f) => {
                f.submitted = false;
                f.polls_left = 0;
                Ok(())
            }
            None => Err(DriverError::InvalidHandle("reset_fence")),
        }
    }

    fn launch_kernel(
        &self,
        list: ListHandle,
        kernel: KernelHandle,
        _group_count: GroupCount,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if !state.lists.contains(&list.0) {
            return Err(DriverError::InvalidHandle("launch_kernel"));
        }
        if !state.kernels.contains_key(&kernel.0) {
            return Err(DriverError::InvalidHandle("launch_kernel"));
        }
        state.launches += 1;
        Ok(())
    }

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
        fence: Option<FenceHandle>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains(&queue.0) {
            return Err(DriverError::InvalidHandle("execute_command_lists"));
        }
        for list in lists {
            if !state.lists.contains(&list.0) {
                return Err(DriverError::InvalidHandle("execute_command_lists"));
            }
        }
        if let Some(fence) = fence {
            let latency = self.fence_latency;
            match state.fences.get_mut(&fence.0) {
                Some(f) => {
                    f.submitted = true;
                    f.polls_left = latency;
                }
                None => return Err(DriverError::InvalidHandle("execute_command_lists")),
            }
        }
        Ok(())
    }

    fn query_fence(&self, fence: FenceHandle) -> Result<FenceStatus, DriverError> {
        let mut state = self.state.lock().unwrap();
        match state.fences.get_mut(&fence.0) {
            Some(f) if f.submitted => {
                if f.polls_left == 0 {
                    Ok(FenceStatus::Ready)
                } else {
                    f.polls_left -= 1;
                    Ok(FenceStatus::Pending)
                }
            }
            Some(_) => Ok(FenceStatus::Pending),
            None => Err(DriverError::InvalidHandle("query_fence")),
        }
    }

    fn export_memory_handle(&self, ptr: DevicePtr) -> Result<OwnedFd, DriverError> {
        let name = CString::new("ccrt-fake-mem").unwrap();
        let raw = memfd_create(&name, MemFdCreateFlag::empty())
            .map_err(|e| DriverError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        let mut file = unsafe { File::from_raw_fd(raw) };
        file.write_all(&ptr.0.to_le_bytes())?;
        Ok(OwnedFd::from(file))
    }

    fn import_memory_handle(&self, fd: OwnedFd) -> Result<DevicePtr, DriverError> {
        let mut file = File::from(fd);
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        Ok(DevicePtr(u64::from_le_bytes(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_ready_after_latency_polls() {
        let driver = FakeDriver::new().with_fence_latency(2);
        let queue = driver
            .create_queue(DeviceId(0), ContextId(0), &QueueDesc::default())
            .unwrap();
        let fence = driver.create_fence(queue, &FenceDesc).unwrap();
        assert_eq!(driver.query_fence(fence).unwrap(), FenceStatus::Pending);
        driver.execute_command_lists(queue, &[], Some(fence)).unwrap();
        assert_eq!(driver.query_fence(fence).unwrap(), FenceStatus::Pending);
        assert_eq!(driver.query_fence(fence).unwrap(), FenceStatus::Pending);
        assert_eq!(driver.query_fence(fence).unwrap(), FenceStatus::Ready);
    }

    #[test]
    fn export_import_preserves_address() {
        let driver = FakeDriver::new();
        let fd = driver.export_memory_handle(DevicePtr(0xdead_beef)).unwrap();
        let ptr = driver.import_memory_handle(fd).unwrap();
        assert_eq!(ptr, DevicePtr(0xdead_beef));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let driver = FakeDriver::new();
        let queue = driver
            .create_queue(DeviceId(0), ContextId(0), &QueueDesc::default())
            .unwrap();
        driver.destroy_queue(queue).unwrap();
        assert!(driver.destroy_queue(queue).is_err());
        assert!(driver.create_fence(queue, &FenceDesc).is_err());
    }
}
