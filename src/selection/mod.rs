//! Algorithm selection. One selector per collective family, each holding a
//! main and a fallback range table plus per-tag admissibility predicates,
//! dispatched through a single registry keyed by the collective kind. The
//! registry is built once at context initialization and is read-only
//! afterwards, so concurrent lookups need no locking.

pub mod table;

mod allgatherv;
mod allreduce;
mod alltoall;
mod alltoallv;
mod barrier;
mod bcast;
mod reduce;
mod reduce_scatter;
mod sparse_allreduce;

pub use allgatherv::AllgathervAlgo;
pub use allreduce::AllreduceAlgo;
pub use alltoall::AlltoallAlgo;
pub use alltoallv::AlltoallvAlgo;
pub use barrier::BarrierAlgo;
pub use bcast::BcastAlgo;
pub use reduce::ReduceAlgo;
pub use reduce_scatter::ReduceScatterAlgo;
pub use sparse_allreduce::SparseAllreduceAlgo;

use strum::IntoEnumIterator;
use thiserror::Error;

use crate::coll::{CollType, DataType, ReduceOp};
use crate::comm::Communicator;
use crate::config::{Config, PriorityMode, TopoAdmissibility};
use crate::transport::TransportKind;

use table::SelectionTable;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no admissible algorithm for {coll:?} at {bytes} bytes")]
    NoAdmissible { coll: CollType, bytes: u64 },
    #[error("forced algorithm '{0}' is not admissible for this call")]
    ForcedNotAdmissible(&'static str),
    #[error("unknown algorithm name '{name}' for {coll:?}")]
    UnknownAlgorithm { coll: CollType, name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferPlacement {
    Host,
    Device,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Host,
    Gpu,
}

/// A forced tag. Strict forces fail selection when inadmissible; plain
/// hints fall back to automatic selection silently.
#[derive(Clone, Copy, Debug)]
pub struct Forced {
    pub algo: Algorithm,
    pub strict: bool,
}

/// Immutable snapshot of one pending collective call, read-only for the
/// lifetime of selection and schedule construction.
#[derive(Clone, Copy, Debug)]
pub struct SelectorParam<'a> {
    pub coll: CollType,
    pub count: usize,
    pub dtype: DataType,
    pub op: Option<ReduceOp>,
    pub comm: &'a Communicator,
    pub transport: TransportKind,
    pub transport_rma: bool,
    pub placement: BufferPlacement,
    pub vendor_buf: bool,
    pub stream: Option<StreamKind>,
    pub forced: Option<Forced>,
}

impl<'a> SelectorParam<'a> {
    /// Host-resident call with no stream and no forced tag.
    pub fn host(
        coll: CollType,
        count: usize,
        dtype: DataType,
        op: Option<ReduceOp>,
        comm: &'a Communicator,
        transport: TransportKind,
    ) -> Self {
        SelectorParam {
            coll,
            count,
            dtype,
            op,
            comm,
            transport,
            transport_rma: false,
            placement: BufferPlacement::Host,
            vendor_buf: false,
            stream: None,
            forced: None,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.count as u64 * self.dtype.count_bytes() as u64
    }
}

/// Runtime flags consulted by the admissibility predicates. Snapshotted
/// from the configuration when the registry is built.
#[derive(Clone, Debug)]
pub struct SelectorEnv {
    pub enable_fusion: bool,
    pub enable_unordered_coll: bool,
    pub priority_mode: PriorityMode,
    pub worker_count: usize,
    pub topo: TopoAdmissibility,
}

impl SelectorEnv {
    fn from_config(config: &Config) -> Self {
        SelectorEnv {
            enable_fusion: config.enable_fusion,
            enable_unordered_coll: config.enable_unordered_coll,
            priority_mode: config.priority_mode,
            worker_count: config.worker_count,
            topo: config.topo.clone(),
        }
    }
}

/// Shared constraint set for the topology-aware ring path. Every limit is
/// data from the configuration snapshot.
pub(crate) fn topo_ring_admissible(param: &SelectorParam<'_>, env: &SelectorEnv) -> bool {
    env.topo.admits(param.comm.size(), param.comm.local_size())
        && matches!(param.stream, Some(StreamKind::Gpu))
        && param.placement == BufferPlacement::Device
        && !param.vendor_buf
        && !(param.comm.size() != 2 && param.transport == TransportKind::Mpi)
        && !env.enable_fusion
        && !env.enable_unordered_coll
        && env.priority_mode == PriorityMode::None
        && env.worker_count == 1
}

pub(crate) trait AlgoTag:
    Copy + Eq + std::fmt::Debug + IntoEnumIterator + Into<&'static str> + Send + Sync + 'static
{
    fn coll() -> CollType;
    fn can_use(self, param: &SelectorParam<'_>, env: &SelectorEnv) -> bool;
    fn into_algorithm(self) -> Algorithm;
    fn from_algorithm(algo: Algorithm) -> Option<Self>;

    fn tag_name(self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Allgatherv(AllgathervAlgo),
    Allreduce(AllreduceAlgo),
    Alltoall(AlltoallAlgo),
    Alltoallv(AlltoallvAlgo),
    Barrier(BarrierAlgo),
    Broadcast(BcastAlgo),
    Reduce(ReduceAlgo),
    ReduceScatter(ReduceScatterAlgo),
    SparseAllreduce(SparseAllreduceAlgo),
}

impl Algorithm {
    pub fn coll(&self) -> CollType {
        match self {
            Algorithm::Allgatherv(_) => CollType::Allgatherv,
            Algorithm::Allreduce(_) => CollType::Allreduce,
            Algorithm::Alltoall(_) => CollType::Alltoall,
            Algorithm::Alltoallv(_) => CollType::Alltoallv,
            Algorithm::Barrier(_) => CollType::Barrier,
            Algorithm::Broadcast(_) => CollType::Broadcast,
            Algorithm::Reduce(_) => CollType::Reduce,
            Algorithm::ReduceScatter(_) => CollType::ReduceScatter,
            Algorithm::SparseAllreduce(_) => CollType::SparseAllreduce,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Allgatherv(a) => (*a).into(),
            Algorithm::Allreduce(a) => (*a).into(),
            Algorithm::Alltoall(a) => (*a).into(),
            Algorithm::Alltoallv(a) => (*a).into(),
            Algorithm::Barrier(a) => (*a).into(),
            Algorithm::Broadcast(a) => (*a).into(),
            Algorithm::Reduce(a) => (*a).into(),
            Algorithm::ReduceScatter(a) => (*a).into(),
            Algorithm::SparseAllreduce(a) => (*a).into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            Algorithm::Allgatherv(AllgathervAlgo::Direct)
                | Algorithm::Allreduce(AllreduceAlgo::Direct)
                | Algorithm::Alltoall(AlltoallAlgo::Direct)
                | Algorithm::Alltoallv(AlltoallvAlgo::Direct)
                | Algorithm::Barrier(BarrierAlgo::Direct)
                | Algorithm::Broadcast(BcastAlgo::Direct)
                | Algorithm::Reduce(ReduceAlgo::Direct)
                | Algorithm::ReduceScatter(ReduceScatterAlgo::Direct)
        )
    }

    pub fn is_topo_ring(&self) -> bool {
        matches!(
            self,
            Algorithm::Allreduce(AllreduceAlgo::TopoRing)
                | Algorithm::Broadcast(BcastAlgo::TopoRing)
                | Algorithm::Reduce(ReduceAlgo::TopoRing)
        )
    }
}

pub(crate) struct FamilySelector<A: AlgoTag> {
    pub(crate) main: SelectionTable<A>,
    pub(crate) fallback: SelectionTable<A>,
    env_forced: Option<A>,
}

impl<A: AlgoTag> FamilySelector<A> {
    pub(crate) fn new(
        main: SelectionTable<A>,
        fallback: SelectionTable<A>,
        env_forced: Option<A>,
    ) -> Self {
        debug_assert!(fallback.covers_everything());
        FamilySelector {
            main,
            fallback,
            env_forced,
        }
    }

    fn get(&self, param: &SelectorParam<'_>, env: &SelectorEnv) -> Result<A, SelectionError> {
        if let Some(forced) = param.forced {
            if let Some(tag) = A::from_algorithm(forced.algo) {
                if tag.can_use(param, env) {
                    return Ok(tag);
                }
                if forced.strict {
                    return Err(SelectionError::ForcedNotAdmissible(tag.tag_name()));
                }
                log::debug!(
                    "forced {} tag '{}' not admissible, falling back to automatic selection",
                    A::coll().name(),
                    tag.tag_name()
                );
            }
        }
        if let Some(tag) = self.env_forced {
            if tag.can_use(param, env) {
                return Ok(tag);
            }
            log::debug!(
                "configured {} override '{}' not admissible for this call",
                A::coll().name(),
                tag.tag_name()
            );
        }
        let bytes = param.bytes();
        if let Some(tag) = self.main.lookup(bytes) {
            if tag.can_use(param, env) {
                return Ok(tag);
            }
        }
        self.get_fallback(param, env)
    }

    /// Selection against the guaranteed-applicable table alone.
    fn get_fallback(
        &self,
        param: &SelectorParam<'_>,
        env: &SelectorEnv,
    ) -> Result<A, SelectionError> {
        let bytes = param.bytes();
        if let Some(tag) = self.fallback.lookup(bytes) {
            if tag.can_use(param, env) {
                return Ok(tag);
            }
        }
        for (_, _, tag) in self.fallback.iter() {
            if tag.can_use(param, env) {
                return Ok(tag);
            }
        }
        Err(SelectionError::NoAdmissible {
            coll: A::coll(),
            bytes,
        })
    }
}

pub(crate) fn parse_override<A: AlgoTag>(raw: Option<&str>) -> Result<Option<A>, SelectionError> {
    match raw {
        None => Ok(None),
        Some("auto") => Ok(None),
        Some(name) => A::iter()
            .find(|a| a.tag_name() == name)
            .map(Some)
            .ok_or_else(|| SelectionError::UnknownAlgorithm {
                coll: A::coll(),
                name: name.to_owned(),
            }),
    }
}

pub struct SelectorRegistry {
    env: SelectorEnv,
    allgatherv: FamilySelector<AllgathervAlgo>,
    allreduce: FamilySelector<AllreduceAlgo>,
    alltoall: FamilySelector<AlltoallAlgo>,
    alltoallv: FamilySelector<AlltoallvAlgo>,
    barrier: FamilySelector<BarrierAlgo>,
    bcast: FamilySelector<BcastAlgo>,
    reduce: FamilySelector<ReduceAlgo>,
    reduce_scatter: FamilySelector<ReduceScatterAlgo>,
    sparse_allreduce: FamilySelector<SparseAllreduceAlgo>,
}

impl SelectorRegistry {
    pub fn new(config: &Config) -> Result<Self, SelectionError> {
        Ok(SelectorRegistry {
            env: SelectorEnv::from_config(config),
            allgatherv: allgatherv::selector(config)?,
            allreduce: allreduce::selector(config)?,
            alltoall: alltoall::selector(config)?,
            alltoallv: alltoallv::selector(config)?,
            barrier: barrier::selector(config)?,
            bcast: bcast::selector(config)?,
            reduce: reduce::selector(config)?,
            reduce_scatter: reduce_scatter::selector(config)?,
            sparse_allreduce: sparse_allreduce::selector(config)?,
        })
    }

    pub fn select(&self, param: &SelectorParam<'_>) -> Result<Algorithm, SelectionError> {
        let algo = match param.coll {
            CollType::Allgatherv => self.allgatherv.get(param, &self.env)?.into_algorithm(),
            CollType::Allreduce => self.allreduce.get(param, &self.env)?.into_algorithm(),
            CollType::Alltoall => self.alltoall.get(param, &self.env)?.into_algorithm(),
            CollType::Alltoallv => self.alltoallv.get(param, &self.env)?.into_algorithm(),
            CollType::Barrier => self.barrier.get(param, &self.env)?.into_algorithm(),
            CollType::Broadcast => self.bcast.get(param, &self.env)?.into_algorithm(),
            CollType::Reduce => self.reduce.get(param, &self.env)?.into_algorithm(),
            CollType::ReduceScatter => self.reduce_scatter.get(param, &self.env)?.into_algorithm(),
            CollType::SparseAllreduce => {
                self.sparse_allreduce.get(param, &self.env)?.into_algorithm()
            }
        };
        log::debug!(
            "selected '{}' for {} ({} bytes)",
            algo.name(),
            param.coll.name(),
            param.bytes()
        );
        Ok(algo)
    }

    /// Ignores the main table entirely; the fallback tier must always
    /// produce an admissible tag.
    pub fn select_fallback(&self, param: &SelectorParam<'_>) -> Result<Algorithm, SelectionError> {
        let algo = match param.coll {
            CollType::Allgatherv => self.allgatherv.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Allreduce => self.allreduce.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Alltoall => self.alltoall.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Alltoallv => self.alltoallv.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Barrier => self.barrier.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Broadcast => self.bcast.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::Reduce => self.reduce.get_fallback(param, &self.env)?.into_algorithm(),
            CollType::ReduceScatter => self
                .reduce_scatter
                .get_fallback(param, &self.env)?
                .into_algorithm(),
            CollType::SparseAllreduce => self
                .sparse_allreduce
                .get_fallback(param, &self.env)?
                .into_algorithm(),
        };
        Ok(algo)
    }

    /// Would this call resolve to a direct (delegating) algorithm?
    pub fn is_direct(&self, param: &SelectorParam<'_>) -> bool {
        self.select(param).map_or(false, |a| a.is_direct())
    }

    /// Would this call resolve to the topology-aware ring path?
    pub fn is_topo_ring(&self, param: &SelectorParam<'_>) -> bool {
        self.select(param).map_or(false, |a| a.is_topo_ring())
    }

    pub fn admissible(&self, algo: Algorithm, param: &SelectorParam<'_>) -> bool {
        match algo {
            Algorithm::Allgatherv(a) => a.can_use(param, &self.env),
            Algorithm::Allreduce(a) => a.can_use(param, &self.env),
            Algorithm::Alltoall(a) => a.can_use(param, &self.env),
            Algorithm::Alltoallv(a) => a.can_use(param, &self.env),
            Algorithm::Barrier(a) => a.can_use(param, &self.env),
            Algorithm::Broadcast(a) => a.can_use(param, &self.env),
            Algorithm::Reduce(a) => a.can_use(param, &self.env),
            Algorithm::ReduceScatter(a) => a.can_use(param, &self.env),
            Algorithm::SparseAllreduce(a) => a.can_use(param, &self.env),
        }
    }
}
