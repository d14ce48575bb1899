use strum::{EnumIter, IntoStaticStr};

use super::table::{SelectionTable, MAX_COLL_SIZE};
use super::{
    parse_override, AlgoTag, Algorithm, FamilySelector, SelectionError, SelectorEnv, SelectorParam,
};
use crate::coll::CollType;
use crate::config::Config;
use crate::transport::TransportKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BarrierAlgo {
    Direct,
    Ring,
}

impl AlgoTag for BarrierAlgo {
    fn coll() -> CollType {
        CollType::Barrier
    }

    fn can_use(self, param: &SelectorParam<'_>, _env: &SelectorEnv) -> bool {
        match self {
            BarrierAlgo::Direct => param.transport == TransportKind::Mpi,
            BarrierAlgo::Ring => true,
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Barrier(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Barrier(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<BarrierAlgo>, SelectionError> {
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, BarrierAlgo::Ring);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, BarrierAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, BarrierAlgo::Ring);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.barrier.as_deref())?,
    ))
}
