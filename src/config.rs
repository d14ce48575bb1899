use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Per-family message-size boundaries for the selection tables, in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionThresholds {
    pub allreduce_short_msg_size: u64,
    pub allreduce_medium_msg_size: u64,
    pub allgatherv_short_msg_size: u64,
    pub alltoall_short_msg_size: u64,
    pub bcast_short_msg_size: u64,
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        SelectionThresholds {
            allreduce_short_msg_size: 1 << 11,
            allreduce_medium_msg_size: 1 << 16,
            allgatherv_short_msg_size: 1 << 15,
            alltoall_short_msg_size: 1 << 13,
            bcast_short_msg_size: 1 << 13,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    None,
    Direct,
    Lifo,
}

/// Admissibility data for the topology-aware ring path. The current
/// hardware limits (communicator sizes 2 and 4, specific local-process
/// counts) are defaults here, not constants baked into the predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopoAdmissibility {
    /// (communicator size, admissible local process counts for that size)
    pub size_local_counts: Vec<(usize, Vec<usize>)>,
}

impl Default for TopoAdmissibility {
    fn default() -> Self {
        TopoAdmissibility {
            size_local_counts: vec![(2, vec![2]), (4, vec![2, 4])],
        }
    }
}

impl TopoAdmissibility {
    pub fn admits(&self, comm_size: usize, local_size: usize) -> bool {
        self.size_local_counts
            .iter()
            .any(|(size, locals)| *size == comm_size && locals.contains(&local_size))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    pub socket_prefix: String,
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        RendezvousConfig {
            poll_interval_ms: 1,
            max_attempts: 10_000,
            socket_dir: default_socket_dir(),
            socket_prefix: "ccrt-hx".to_owned(),
        }
    }
}

/// Per-family algorithm overrides: a tag name forces that algorithm,
/// "auto" (or absence) leaves the tables in charge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgoOverrides {
    pub allgatherv: Option<String>,
    pub allreduce: Option<String>,
    pub alltoall: Option<String>,
    pub alltoallv: Option<String>,
    pub barrier: Option<String>,
    pub bcast: Option<String>,
    pub reduce: Option<String>,
    pub reduce_scatter: Option<String>,
    pub sparse_allreduce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub transport: TransportKindConfig,
    #[serde(default)]
    pub enable_fusion: bool,
    #[serde(default)]
    pub enable_unordered_coll: bool,
    #[serde(default = "default_priority_mode")]
    pub priority_mode: PriorityMode,
    #[serde(default)]
    pub serialize_kernel_launch: bool,
    #[serde(default = "default_kernels_path")]
    pub kernels_path: PathBuf,
    #[serde(default)]
    pub thresholds: SelectionThresholds,
    #[serde(default)]
    pub topo: TopoAdmissibility,
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub algo: AlgoOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportKindConfig {
    pub kind: TransportKind,
    #[serde(default)]
    pub rma: bool,
}

impl Default for TransportKindConfig {
    fn default() -> Self {
        TransportKindConfig {
            kind: TransportKind::Fabric,
            rma: false,
        }
    }
}

fn default_worker_count() -> usize {
    1
}

fn default_priority_mode() -> PriorityMode {
    PriorityMode::None
}

fn default_kernels_path() -> PathBuf {
    PathBuf::from("kernels")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: default_worker_count(),
            transport: TransportKindConfig::default(),
            enable_fusion: false,
            enable_unordered_coll: false,
            priority_mode: default_priority_mode(),
            serialize_kernel_launch: false,
            kernels_path: default_kernels_path(),
            thresholds: SelectionThresholds::default(),
            topo: TopoAdmissibility::default(),
            rendezvous: RendezvousConfig::default(),
            algo: AlgoOverrides::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `CCRT_<FAMILY>_ALGO` environment variables take precedence over the
    /// file-level `[algo]` section.
    pub fn apply_env_overrides(&mut self) {
        let slots: [(&str, &mut Option<String>); 9] = [
            ("CCRT_ALLGATHERV_ALGO", &mut self.algo.allgatherv),
            ("CCRT_ALLREDUCE_ALGO", &mut self.algo.allreduce),
            ("CCRT_ALLTOALL_ALGO", &mut self.algo.alltoall),
            ("CCRT_ALLTOALLV_ALGO", &mut self.algo.alltoallv),
            ("CCRT_BARRIER_ALGO", &mut self.algo.barrier),
            ("CCRT_BCAST_ALGO", &mut self.algo.bcast),
            ("CCRT_REDUCE_ALGO", &mut self.algo.reduce),
            ("CCRT_REDUCE_SCATTER_ALGO", &mut self.algo.reduce_scatter),
            ("CCRT_SPARSE_ALLREDUCE_ALGO", &mut self.algo.sparse_allreduce),
        ];
        for (var, slot) in slots {
            if let Ok(value) = std::env::var(var) {
                *slot = Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.priority_mode, PriorityMode::None);
        assert!(!config.enable_fusion);
        assert!(config.thresholds.allreduce_short_msg_size < config.thresholds.allreduce_medium_msg_size);
    }

    #[test]
    fn topo_admissibility_is_data_driven(){
        let topo = TopoAdmissibility::default();
        assert!(topo.admits(2, 2));
        assert!(topo.admits(4, 2));
        assert!(topo.admits(4, 4));
        assert!(!topo.admits(3, 3));
        assert!(!topo.admits(2, 1));

        let wide = TopoAdmissibility {
            size_local_counts: vec![(8, vec![8])],
        };
        assert!(wide.admits(8, 8));
        assert!(!wide.admits(4, 4));
    }

    #[test]
    fn toml_roundtrip_with_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.worker_count, 1);

        let parsed: Config = toml::from_str(
            "worker_count = 2\n\n[transport]\nkind = \"mpi\"\nrma = true\n",
        )
        .unwrap();
        assert_eq!(parsed.worker_count, 2);
        assert_eq!(parsed.transport.kind, TransportKind::Mpi);
        assert!(parsed.transport.rma);
    }
}
