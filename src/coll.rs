use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoStaticStr};

/// The collective families the runtime dispatches over.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CollType {
    Allgatherv,
    Allreduce,
    Alltoall,
    Alltoallv,
    Barrier,
    Broadcast,
    Reduce,
    ReduceScatter,
    SparseAllreduce,
}

impl CollType {
    pub fn name(&self) -> &'static str {
        (*self).into()
    }

    pub fn is_reduction(&self) -> bool {
        matches!(
            self,
            CollType::Allreduce
                | CollType::Reduce
                | CollType::ReduceScatter
                | CollType::SparseAllreduce
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Uint8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub fn count_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Float16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn coll_names_are_registered() {
        for coll in CollType::iter() {
            assert!(!coll.name().is_empty());
        }
        assert_eq!(CollType::ReduceScatter.name(), "reduce_scatter");
    }

    #[test]
    fn reduction_classification() {
        assert!(CollType::Allreduce.is_reduction());
        assert!(!CollType::Broadcast.is_reduction());
        assert!(!CollType::Barrier.is_reduction());
    }
}
