use strum::{EnumIter, IntoStaticStr};

use super::table::{SelectionTable, MAX_COLL_SIZE};
use super::{
    parse_override, AlgoTag, Algorithm, FamilySelector, SelectionError, SelectorEnv, SelectorParam,
};
use crate::coll::{CollType, ReduceOp};
use crate::config::Config;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SparseAllreduceAlgo {
    Ring,
    Mask,
    Allgatherv,
}

impl AlgoTag for SparseAllreduceAlgo {
    fn coll() -> CollType {
        CollType::SparseAllreduce
    }

    fn can_use(self, param: &SelectorParam<'_>, _env: &SelectorEnv) -> bool {
        match self {
            SparseAllreduceAlgo::Ring | SparseAllreduceAlgo::Allgatherv => true,
            // the mask variant merges indices and only composes with sum
            SparseAllreduceAlgo::Mask => param.op == Some(ReduceOp::Sum),
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::SparseAllreduce(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::SparseAllreduce(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(
    config: &Config,
) -> Result<FamilySelector<SparseAllreduceAlgo>, SelectionError> {
    let mut main = SelectionTable::new();
    main.insert(0, MAX_COLL_SIZE, SparseAllreduceAlgo::Ring);
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, SparseAllreduceAlgo::Ring);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.sparse_allreduce.as_deref())?,
    ))
}
