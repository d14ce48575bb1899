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
pub enum BcastAlgo {
    Direct,
    Ring,
    DoubleTree,
    Naive,
    TopoRing,
}

impl AlgoTag for BcastAlgo {
    fn coll() -> CollType {
        CollType::Broadcast
    }

    fn can_use(self, param: &SelectorParam<'_>, env: &SelectorEnv) -> bool {
        match self {
            BcastAlgo::Direct => param.transport == TransportKind::Mpi,
            BcastAlgo::Ring | BcastAlgo::DoubleTree | BcastAlgo::Naive => true,
            BcastAlgo::TopoRing => topo_ring_admissible(param, env),
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Broadcast(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Broadcast(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<BcastAlgo>, SelectionError> {
    let t = &config.thresholds;
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, BcastAlgo::Ring);
            main.insert(0, t.bcast_short_msg_size, BcastAlgo::Naive);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, BcastAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, BcastAlgo::Ring);
    fallback.insert(0, t.bcast_short_msg_size, BcastAlgo::Naive);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.bcast.as_deref())?,
    ))
}
