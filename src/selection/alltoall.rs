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
pub enum AlltoallAlgo {
    Direct,
    Naive,
    Scatter,
    ScatterBarrier,
}

impl AlgoTag for AlltoallAlgo {
    fn coll() -> CollType {
        CollType::Alltoall
    }

    fn can_use(self, param: &SelectorParam<'_>, _env: &SelectorEnv) -> bool {
        match self {
            AlltoallAlgo::Direct => param.transport == TransportKind::Mpi,
            AlltoallAlgo::Naive | AlltoallAlgo::Scatter | AlltoallAlgo::ScatterBarrier => true,
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Alltoall(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Alltoall(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<AlltoallAlgo>, SelectionError> {
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, AlltoallAlgo::Naive);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, AlltoallAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, AlltoallAlgo::Naive);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.alltoall.as_deref())?,
    ))
}
