use strum::{EnumIter, IntoStaticStr};

use super::table::{SelectionTable, MAX_COLL_SIZE};
use super::{
    parse_override, topo_ring_admissible, AlgoTag, Algorithm, FamilySelector, SelectionError,
    SelectorEnv, SelectorParam,
};
use crate::coll::CollType;
use crate::config::Config;
use crate::transport::TransportKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AllreduceAlgo {
    Direct,
    HalvingDoubling,
    Starlike,
    Ring,
    RingRma,
    DoubleTree,
    RecursiveDoubling,
    TwoDimensional,
    TopoRing,
}

impl AlgoTag for AllreduceAlgo {
    fn coll() -> CollType {
        CollType::Allreduce
    }

    fn can_use(self, param: &SelectorParam<'_>, env: &SelectorEnv) -> bool {
        match self {
            AllreduceAlgo::Direct => param.transport == TransportKind::Mpi,
            AllreduceAlgo::HalvingDoubling => param.count >= param.comm.pof2(),
            AllreduceAlgo::Starlike => param.count / param.comm.size() > 0,
            AllreduceAlgo::Ring => true,
            AllreduceAlgo::RingRma => param.transport_rma,
            AllreduceAlgo::DoubleTree => true,
            AllreduceAlgo::RecursiveDoubling => {
                param.comm.is_pof2() && param.count >= param.comm.pof2()
            }
            AllreduceAlgo::TwoDimensional => param.transport != TransportKind::Mpi,
            AllreduceAlgo::TopoRing => topo_ring_admissible(param, env),
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Allreduce(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Allreduce(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<AllreduceAlgo>, SelectionError> {
    let t = &config.thresholds;
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, AllreduceAlgo::Ring);
            main.insert(0, t.allreduce_short_msg_size, AllreduceAlgo::RecursiveDoubling);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, AllreduceAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, AllreduceAlgo::Ring);
    fallback.insert(0, t.allreduce_short_msg_size, AllreduceAlgo::RecursiveDoubling);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.allreduce.as_deref())?,
    ))
}
