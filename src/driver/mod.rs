//! Contract of the vendor device driver consumed by the resource cache and
//! the GPU schedule entries. All calls are synchronous; any non-success
//! status is fatal to the operation that issued it (the engine never
//! retries a failed driver call).

pub mod fake;

use std::os::fd::OwnedFd;
use std::path::Path;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

/// Opaque device-memory address as the driver sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn with_offset(self, offset: u64) -> DevicePtr {
        DevicePtr(self.0 + offset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueueDesc {
    pub ordinal: u32,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ListDesc {
    pub ordinal: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FenceDesc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupCount {
    pub fn linear(x: u32) -> Self {
        GroupCount { x, y: 1, z: 1 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Ready,
    Pending,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver call {call} failed with status {status}")]
    Call { call: &'static str, status: i32 },
    #[error("kernel image not found: {0}")]
    ModuleNotFound(String),
    #[error("kernel '{0}' not present in module")]
    KernelNotFound(String),
    #[error("invalid handle passed to {0}")]
    InvalidHandle(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait DeviceDriver: Send + Sync {
    fn create_queue(
        &self,
        device: DeviceId,
        context: ContextId,
        desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError>;
    fn destroy_queue(&self, queue: QueueHandle) -> Result<(), DriverError>;

    fn create_command_list(
        &self,
        device: DeviceId,
        context: ContextId,
        desc: &ListDesc,
    ) -> Result<ListHandle, DriverError>;
    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError>;

    fn load_module(
        &self,
        device: DeviceId,
        context: ContextId,
        image: &Path,
    ) -> Result<ModuleHandle, DriverError>;
    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError>;

    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError>;

    fn create_fence(&self, queue: QueueHandle, desc: &FenceDesc) -> Result<FenceHandle, DriverError>;
    fn destroy_fence(&self, fence: FenceHandle) -> Result<(), DriverError>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DriverError>;

    fn launch_kernel(
        &self,
        list: ListHandle,
        kernel: KernelHandle,
        group_count: GroupCount,
    ) -> Result<(), DriverError>;

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
        fence: Option<FenceHandle>,
    ) -> Result<(), DriverError>;

    /// Non-blocking completion poll.
    fn query_fence(&self, fence: FenceHandle) -> Result<FenceStatus, DriverError>;

    /// Turn a local device allocation into a transferable descriptor. The
    /// descriptor is only meaningful when passed through the OS
    /// ancillary-data facility; its numeric value is process-local.
    fn export_memory_handle(&self, ptr: DevicePtr) -> Result<OwnedFd, DriverError>;

    /// Reconstruct a device address from a received descriptor.
    fn import_memory_handle(&self, fd: OwnedFd) -> Result<DevicePtr, DriverError>;
}
