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
pub enum AllgathervAlgo {
    Direct,
    Naive,
    Ring,
    Flat,
    MultiBcast,
}

impl AlgoTag for AllgathervAlgo {
    fn coll() -> CollType {
        CollType::Allgatherv
    }

    fn can_use(self, param: &SelectorParam<'_>, _env: &SelectorEnv) -> bool {
        match self {
            AllgathervAlgo::Direct => param.transport == TransportKind::Mpi,
            AllgathervAlgo::Naive
            | AllgathervAlgo::Ring
            | AllgathervAlgo::Flat
            | AllgathervAlgo::MultiBcast => true,
        }
    }

    fn into_algorithm(self) -> Algorithm {
        Algorithm::Allgatherv(self)
    }

    fn from_algorithm(algo: Algorithm) -> Option<Self> {
        match algo {
            Algorithm::Allgatherv(a) => Some(a),
            _ => None,
        }
    }
}

pub(super) fn selector(config: &Config) -> Result<FamilySelector<AllgathervAlgo>, SelectionError> {
    let t = &config.thresholds;
    let mut main = SelectionTable::new();
    match config.transport.kind {
        TransportKind::Fabric => {
            main.insert(0, MAX_COLL_SIZE, AllgathervAlgo::Ring);
            main.insert(0, t.allgatherv_short_msg_size, AllgathervAlgo::Naive);
        }
        TransportKind::Mpi => {
            main.insert(0, MAX_COLL_SIZE, AllgathervAlgo::Direct);
        }
    }
    let mut fallback = SelectionTable::new();
    fallback.insert(0, MAX_COLL_SIZE, AllgathervAlgo::Ring);
    fallback.insert(0, t.allgatherv_short_msg_size, AllgathervAlgo::Naive);
    Ok(FamilySelector::new(
        main,
        fallback,
        parse_override(config.algo.allgatherv.as_deref())?,
    ))
}
