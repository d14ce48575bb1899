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
pub enum ReduceScatterAlgo {
    Direct,
    Ring,
}

impl AlgoTag for ReduceScatterAlgo {
    fn coll() -> CollType {
        CollType::ReduceScatter
    }

    fn can_use(self, param: &SelectorParam<'_>, _env: &SelectorEnv) -> bool {
        match self {
            ReduceScatterAlgo::Direct => param.transport == TransportKind::Mpi,
            ReduceScatterAlgo::Ring => true,
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::ReduceScatter(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::ReduceScatter(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(
    config: &Config,
) -> Result<FamilySelector<ReduceScatterAlgo>, SelectionError> {
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, ReduceScatterAlgo::Ring);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, ReduceScatterAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, ReduceScatterAlgo::Ring);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.reduce_scatter.as_deref())?,
    ))
}
