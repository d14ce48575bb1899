//! Explicitly constructed runtime context: the dependency-injection root
//! holding the driver, the resource cache, the selector tables, and the
//! schedule cache. Initialization order is driver, then cache, then
//! selector tables; teardown runs in reverse.

use std::sync::Arc;

use crate::cache::ResourceCache;
use crate::comm::Communicator;
use crate::config::Config;
use crate::driver::{ContextId, DeviceDriver, DeviceId, DriverError};
use crate::engine::LaunchLimiter;
use crate::sched::build::{build_schedule, OpDesc};
use crate::sched::{SchedContext, SchedError, Schedule, ScheduleCache, ScheduleFingerprint};
use crate::selection::{Algorithm, SelectionError, SelectorParam, SelectorRegistry};
use crate::transport::Endpoint;

pub struct Context {
    pub config: Arc<Config>,
    pub driver: Arc<dyn DeviceDriver>,
    pub cache: Arc<ResourceCache>,
    pub selectors: Arc<SelectorRegistry>,
    pub sched_cache: Arc<ScheduleCache>,
    pub launcher: Arc<LaunchLimiter>,
}

impl Context {
    /// The driver must already be initialized; the cache wraps it, and the
    /// selector tables are built last from the configuration snapshot.
    pub fn new(config: Config, driver: Arc<dyn DeviceDriver>) -> Result<Self, SelectionError> {
        let cache = Arc::new(ResourceCache::new(
            Arc::clone(&driver),
            config.kernels_path.clone(),
        ));
        let selectors = Arc::new(SelectorRegistry::new(&config)?);
        let launcher = Arc::new(LaunchLimiter::new(config.serialize_kernel_launch));
        Ok(Context {
            config: Arc::new(config),
            driver,
            cache,
            selectors,
            sched_cache: Arc::new(ScheduleCache::new()),
            launcher,
        })
    }

    pub fn select(&self, param: &SelectorParam<'_>) -> Result<Algorithm, SelectionError> {
        self.selectors.select(param)
    }

    pub fn fingerprint(
        &self,
        param: &SelectorParam<'_>,
        algo: Algorithm,
        desc: &OpDesc,
    ) -> ScheduleFingerprint {
        ScheduleFingerprint {
            coll: param.coll,
            count: desc.count,
            dtype: param.dtype,
            op: param.op,
            algo,
            placement: param.placement,
            comm: param.comm.id(),
            send_buf: desc.send.device_ptr().0,
            recv_buf: desc.recv.device_ptr().0,
        }
    }

    /// A cached schedule, checked out exclusively, ready to re-arm. It
    /// keeps the endpoint and resources of its original construction.
    pub fn checkout_cached(&self, fingerprint: &ScheduleFingerprint) -> Option<Schedule> {
        self.sched_cache.checkout(fingerprint)
    }

    /// Builds a fresh schedule for an already-selected algorithm.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &self,
        param: &SelectorParam<'_>,
        algo: Algorithm,
        endpoint: Box<dyn Endpoint>,
        desc: &OpDesc,
        worker: usize,
        device: DeviceId,
        device_context: ContextId,
        cacheable: bool,
    ) -> Result<Schedule, SchedError> {
        let comm: Communicator = param.comm.clone();
        let ctx = SchedContext::new(
            comm,
            endpoint,
            Arc::clone(&self.driver),
            Arc::clone(&self.cache),
            Arc::clone(&self.launcher),
            self.config.rendezvous.clone(),
            worker,
            device,
            device_context,
            param.dtype,
            param.op,
            param.placement,
            cacheable,
        );
        build_schedule(ctx, algo, desc)
    }

    /// Reverse teardown: pooled device objects die before the driver
    /// reference is dropped.
    pub fn shutdown(self) -> Result<(), DriverError> {
        self.cache.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coll::{CollType, DataType, ReduceOp};
    use crate::comm::CommunicatorId;
    use crate::driver::fake::FakeDriver;
    use crate::transport::local::local_fabric;
    use crate::transport::TransportKind;

    #[test]
    fn context_wires_the_components_together() {
        let driver = Arc::new(FakeDriver::new());
        let ctx = Context::new(Config::default(), driver).unwrap();
        let comm = Communicator::new(CommunicatorId(7), 0, 1);
        let param = SelectorParam::host(
            CollType::Allreduce,
            256,
            DataType::Float32,
            Some(ReduceOp::Sum),
            &comm,
            TransportKind::Fabric,
        );
        let algo = ctx.select(&param).unwrap();
        let mut send = vec![0u8; 1024];
        let mut recv = vec![0u8; 1024];
        let desc = OpDesc {
            send: crate::sched::BufPtr::from_slice(&mut send),
            recv: crate::sched::BufPtr::from_slice(&mut recv),
            count: 256,
            root: 0,
            counts: None,
        };
        let endpoint = Box::new(local_fabric(1).remove(0));
        let sched = ctx
            .prepare(&param, algo, endpoint, &desc, 0, DeviceId(0), ContextId(0), false)
            .unwrap();
        assert!(sched.fingerprint().is_none());
        ctx.shutdown().unwrap();
    }
}
