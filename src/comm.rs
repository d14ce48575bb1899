#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommunicatorId(pub u32);

/// Fixed set of participating ranks plus addressing/topology metadata.
/// Immutable once constructed; every collective call borrows it read-only.
#[derive(Clone, Debug)]
pub struct Communicator {
    id: CommunicatorId,
    rank: usize,
    num_ranks: usize,
    local_rank: usize,
    local_num_ranks: usize,
}

impl Communicator {
    /// Single-node communicator: every rank is local.
    pub fn new(id: CommunicatorId, rank: usize, num_ranks: usize) -> Self {
        assert!(num_ranks > 0 && rank < num_ranks);
        Communicator {
            id,
            rank,
            num_ranks,
            local_rank: rank,
            local_num_ranks: num_ranks,
        }
    }

    pub fn with_locality(mut self, local_rank: usize, local_num_ranks: usize) -> Self {
        assert!(local_num_ranks <= self.num_ranks && local_rank < local_num_ranks);
        self.local_rank = local_rank;
        self.local_num_ranks = local_num_ranks;
        self
    }

    pub fn id(&self) -> CommunicatorId {
        self.id
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.num_ranks
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn local_size(&self) -> usize {
        self.local_num_ranks
    }

    /// Largest power of two that does not exceed the communicator size.
    pub fn pof2(&self) -> usize {
        let mut pof2 = 1;
        while pof2 * 2 <= self.num_ranks {
            pof2 *= 2;
        }
        pof2
    }

    pub fn is_pof2(&self) -> bool {
        self.num_ranks.is_power_of_two()
    }

    pub fn ring_next(&self) -> usize {
        (self.rank + 1) % self.num_ranks
    }

    pub fn ring_prev(&self) -> usize {
        (self.rank + self.num_ranks - 1) % self.num_ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pof2_rounds_down() {
        let comm = Communicator::new(CommunicatorId(0), 0, 6);
        assert_eq!(comm.pof2(), 4);
        assert!(!comm.is_pof2());
        let comm = Communicator::new(CommunicatorId(0), 0, 8);
        assert_eq!(comm.pof2(), 8);
        assert!(comm.is_pof2());
    }

    #[test]
    fn ring_neighbors_wrap() {
        let comm = Communicator::new(CommunicatorId(0), 0, 4);
        assert_eq!(comm.ring_prev(), 3);
        assert_eq!(comm.ring_next(), 1);
        let comm = Communicator::new(CommunicatorId(0), 3, 4);
        assert_eq!(comm.ring_prev(), 2);
        assert_eq!(comm.ring_next(), 0);
    }
}
