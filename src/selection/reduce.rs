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
pub enum ReduceAlgo {
    Direct,
    HalvingDoubling,
    Tree,
    DoubleTree,
    TopoRing,
}

impl AlgoTag for ReduceAlgo {
    fn coll() -> CollType {
        CollType::Reduce
    }

    fn can_use(self, param: &SelectorParam<'_>, env: &SelectorEnv) -> bool {
        match self {
            ReduceAlgo::Direct => param.transport == TransportKind::Mpi,
            ReduceAlgo::HalvingDoubling => param.count >= param.comm.pof2(),
            ReduceAlgo::Tree | ReduceAlgo::DoubleTree => true,
            ReduceAlgo::TopoRing => topo_ring_admissible(param, env),
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Reduce(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Reduce(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<ReduceAlgo>, SelectionError> {
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, ReduceAlgo::Tree);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, ReduceAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, ReduceAlgo::Tree);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.reduce.as_deref())?,
    ))
}
