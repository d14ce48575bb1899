//! Schedule builders: one per implemented (collective, algorithm) pair.
//! Each builder emits the entry sequence realizing the chosen strategy;
//! combinations without a builder surface as a distinct not-implemented
//! error so callers can tell missing coverage from runtime failure.

use crate::coll::CollType;
use crate::driver::GroupCount;
use crate::exchange::rendezvous::{BufferSlot, PeerSpec};
use crate::selection::{
    Algorithm, AllgathervAlgo, AllreduceAlgo, AlltoallAlgo, BarrierAlgo, BcastAlgo, ReduceAlgo,
    ReduceScatterAlgo,
};

use super::entry::{
    CopyEntry, HandleExchangeEntry, KernelEntry, RecvEntry, RecvReduceEntry, SendEntry, SyncEntry,
};
use super::{BufPtr, SchedContext, SchedError, Schedule, ScheduleBuilder, ScheduleFingerprint};

/// Operand description for one collective call. `recv` must be valid on
/// every rank (reduction builders use it as workspace on non-root ranks).
#[derive(Clone, Debug)]
pub struct OpDesc {
    pub send: BufPtr,
    pub recv: BufPtr,
    /// Element count: per-rank output count for reduce-scatter, the
    /// per-rank contribution for allgatherv (when `counts` is absent),
    /// the full buffer otherwise.
    pub count: usize,
    pub root: usize,
    /// Per-rank contributions for allgatherv.
    pub counts: Option<Vec<usize>>,
}

// tag layout: phase in the high half, step in the low half; tags only
// need to be unique within one schedule's endpoint
fn tag(phase: u32, step: usize) -> u64 {
    ((phase as u64) << 32) | step as u64
}

fn chunk_count(count: usize, n: usize, idx: usize) -> usize {
    count / n + usize::from(idx < count % n)
}

fn chunk_offset(count: usize, n: usize, idx: usize) -> usize {
    idx * (count / n) + idx.min(count % n)
}

pub fn build_schedule(
    mut ctx: SchedContext,
    algo: Algorithm,
    desc: &OpDesc,
) -> Result<Schedule, SchedError> {
    let mut b = ScheduleBuilder::new();
    match algo {
        Algorithm::Allreduce(AllreduceAlgo::Ring) => build_allreduce_ring(&mut b, &ctx, desc),
        Algorithm::Allreduce(AllreduceAlgo::RecursiveDoubling) => {
            build_allreduce_recursive_doubling(&mut b, &ctx, desc)
        }
        Algorithm::Allreduce(AllreduceAlgo::TopoRing) => build_allreduce_topo(&mut b, &ctx, desc),
        Algorithm::Broadcast(BcastAlgo::Naive) => build_bcast_naive(&mut b, &ctx, desc),
        Algorithm::Broadcast(BcastAlgo::Ring) => build_bcast_ring(&mut b, &ctx, desc),
        Algorithm::Reduce(ReduceAlgo::Tree) => build_reduce_tree(&mut b, &ctx, desc),
        Algorithm::Allgatherv(AllgathervAlgo::Ring) => build_allgatherv_ring(&mut b, &ctx, desc),
        Algorithm::Allgatherv(AllgathervAlgo::Naive) => build_allgatherv_naive(&mut b, &ctx, desc),
        Algorithm::ReduceScatter(ReduceScatterAlgo::Ring) => {
            build_reduce_scatter_ring(&mut b, &mut ctx, desc)
        }
        Algorithm::Alltoall(AlltoallAlgo::Naive) => build_alltoall_naive(&mut b, &ctx, desc),
        Algorithm::Barrier(BarrierAlgo::Ring) => build_barrier_ring(&mut b, &ctx),
        other => {
            return Err(SchedError::NotImplemented {
                coll: other.coll(),
                algo: other.name(),
            })
        }
    }
    let fingerprint = ctx.cacheable.then_some(ScheduleFingerprint {
        coll: algo.coll(),
        count: desc.count,
        dtype: ctx.dtype,
        op: ctx.op,
        algo,
        placement: ctx.placement,
        comm: ctx.comm.id(),
        send_buf: desc.send.device_ptr().0,
        recv_buf: desc.recv.device_ptr().0,
    });
    log::debug!(
        "rank {} built {} schedule ('{}')",
        ctx.comm.rank(),
        algo.coll().name(),
        algo.name()
    );
    Ok(b.build(ctx, fingerprint))
}

/// Ring all-reduce: reduce-scatter pass then allgather pass, one chunk
/// per rank.
fn build_allreduce_ring(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let count = desc.count;
    let send = desc.send.byte_range(0, count * esz);
    let recv = desc.recv.byte_range(0, count * esz);
    let chunk = |idx: usize| {
        recv.byte_range(
            chunk_offset(count, n, idx) * esz,
            chunk_count(count, n, idx) * esz,
        )
    };

    b.add(Box::new(CopyEntry::new(send, recv)));
    if n == 1 {
        return;
    }
    let next = ctx.comm.ring_next();
    let prev = ctx.comm.ring_prev();
    for s in 0..n - 1 {
        b.add_barrier();
        let send_idx = (r + n - s) % n;
        let recv_idx = (r + n - s - 1) % n;
        b.add(Box::new(SendEntry::new(next, tag(0, s), chunk(send_idx))));
        b.add(Box::new(RecvReduceEntry::new(
            prev,
            tag(0, s),
            chunk(recv_idx),
        )));
    }
    for s in 0..n - 1 {
        b.add_barrier();
        let send_idx = (r + 1 + n - s) % n;
        let recv_idx = (r + n - s) % n;
        b.add(Box::new(SendEntry::new(next, tag(1, s), chunk(send_idx))));
        b.add(Box::new(RecvEntry::new(prev, tag(1, s), chunk(recv_idx))));
    }
}

/// Full-buffer pairwise exchange over log2(n) rounds; admissibility
/// restricts this to power-of-two communicators.
fn build_allreduce_recursive_doubling(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let send = desc.send.byte_range(0, desc.count * esz);
    let recv = desc.recv.byte_range(0, desc.count * esz);

    b.add(Box::new(CopyEntry::new(send, recv)));
    let rounds = n.trailing_zeros() as usize;
    for d in 0..rounds {
        b.add_barrier();
        let partner = r ^ (1 << d);
        b.add(Box::new(SendEntry::new(partner, tag(2, d), recv)));
        b.add(Box::new(RecvReduceEntry::new(partner, tag(2, d), recv)));
    }
}

/// Topology-aware ring: exchange buffer handles with the ring neighbors,
/// then run the device kernel against the imported peer memory.
fn build_allreduce_topo(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let prev = ctx.comm.ring_prev();
    let next = ctx.comm.ring_next();
    let mut peer_ranks = vec![prev];
    if next != prev {
        peer_ranks.push(next);
    }
    let peers: Vec<PeerSpec> = peer_ranks
        .iter()
        .map(|&rank| PeerSpec {
            rank,
            skipped: false,
        })
        .collect();
    let slots = vec![
        BufferSlot {
            ptr: desc.send.device_ptr(),
            offset: 0,
        },
        BufferSlot {
            ptr: desc.recv.device_ptr(),
            offset: 0,
        },
    ];
    let scope = format!("c{}-allreduce", ctx.comm.id().0);
    b.add(Box::new(HandleExchangeEntry::new(scope, slots, peers, false)));
    b.add_barrier();

    let required = peer_ranks
        .iter()
        .flat_map(|&rank| [(rank, 0), (rank, 1)])
        .collect();
    let kernel_name = format!("{}_{}", CollType::Allreduce.name(), ctx.dtype.name());
    let groups = GroupCount::linear(((desc.count.max(1) + 255) / 256) as u32);
    b.add(Box::new(KernelEntry::new(
        CollType::Allreduce,
        kernel_name,
        groups,
        required,
    )));
}

fn build_bcast_naive(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let buf = desc
        .recv
        .byte_range(0, desc.count * ctx.dtype.count_bytes());
    if r == desc.root {
        for peer in (0..n).filter(|&p| p != r) {
            b.add(Box::new(SendEntry::new(peer, tag(3, 0), buf)));
        }
    } else {
        b.add(Box::new(RecvEntry::new(desc.root, tag(3, 0), buf)));
    }
}

/// Pass-along ring: each rank forwards the buffer to its next neighbor
/// until the ring closes back at the root.
fn build_bcast_ring(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    if n == 1 {
        return;
    }
    let r = ctx.comm.rank();
    let buf = desc
        .recv
        .byte_range(0, desc.count * ctx.dtype.count_bytes());
    if r != desc.root {
        b.add(Box::new(RecvEntry::new(ctx.comm.ring_prev(), tag(4, 0), buf)));
    }
    if ctx.comm.ring_next() != desc.root {
        b.add_barrier();
        b.add(Box::new(SendEntry::new(ctx.comm.ring_next(), tag(4, 0), buf)));
    }
}

/// Binomial tree reduce toward the root. Non-root ranks use `recv` as
/// workspace; its final contents there are unspecified.
fn build_reduce_tree(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let send = desc.send.byte_range(0, desc.count * esz);
    let recv = desc.recv.byte_range(0, desc.count * esz);

    b.add(Box::new(CopyEntry::new(send, recv)));
    let vrank = (r + n - desc.root) % n;
    let mut mask = 1usize;
    let mut step = 0usize;
    while mask < n {
        b.add_barrier();
        if vrank & mask != 0 {
            let peer = (vrank - mask + desc.root) % n;
            b.add(Box::new(SendEntry::new(peer, tag(5, step), recv)));
            break;
        }
        let peer_v = vrank + mask;
        if peer_v < n {
            let peer = (peer_v + desc.root) % n;
            b.add(Box::new(RecvReduceEntry::new(peer, tag(5, step), recv)));
        }
        mask <<= 1;
        step += 1;
    }
}

fn allgatherv_layout(ctx: &SchedContext, desc: &OpDesc) -> (Vec<usize>, Vec<usize>) {
    let n = ctx.comm.size();
    let counts = desc
        .counts
        .clone()
        .unwrap_or_else(|| vec![desc.count; n]);
    let mut offsets = Vec::with_capacity(n);
    let mut acc = 0usize;
    for c in &counts {
        offsets.push(acc);
        acc += c;
    }
    (counts, offsets)
}

fn build_allgatherv_ring(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let (counts, offsets) = allgatherv_layout(ctx, desc);
    let chunk = |idx: usize| desc.recv.byte_range(offsets[idx] * esz, counts[idx] * esz);

    b.add(Box::new(CopyEntry::new(
        desc.send.byte_range(0, counts[r] * esz),
        chunk(r),
    )));
    if n == 1 {
        return;
    }
    let next = ctx.comm.ring_next();
    let prev = ctx.comm.ring_prev();
    for s in 0..n - 1 {
        b.add_barrier();
        let send_idx = (r + n - s) % n;
        let recv_idx = (r + n - s - 1) % n;
        b.add(Box::new(SendEntry::new(next, tag(6, s), chunk(send_idx))));
        b.add(Box::new(RecvEntry::new(prev, tag(6, s), chunk(recv_idx))));
    }
}

fn build_allgatherv_naive(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let (counts, offsets) = allgatherv_layout(ctx, desc);
    let own = desc.send.byte_range(0, counts[r] * esz);

    b.add(Box::new(CopyEntry::new(
        own,
        desc.recv.byte_range(offsets[r] * esz, counts[r] * esz),
    )));
    for peer in (0..n).filter(|&p| p != r) {
        b.add(Box::new(SendEntry::new(peer, tag(7, 0), own)));
        b.add(Box::new(RecvEntry::new(
            peer,
            tag(7, 0),
            desc.recv.byte_range(offsets[peer] * esz, counts[peer] * esz),
        )));
    }
}

/// Ring reduce-scatter over a scratch copy of the input; the rank's own
/// reduced chunk lands in `recv`.
fn build_reduce_scatter_ring(b: &mut ScheduleBuilder, ctx: &mut SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let count = desc.count;
    let total = count * n;
    let send = desc.send.byte_range(0, total * esz);
    let recv = desc.recv.byte_range(0, count * esz);
    if n == 1 {
        b.add(Box::new(CopyEntry::new(send, recv)));
        return;
    }
    let scratch = ctx.alloc_scratch(total * esz);
    let chunk = |idx: usize| scratch.byte_range(idx * count * esz, count * esz);

    b.add(Box::new(CopyEntry::new(send, scratch)));
    let next = ctx.comm.ring_next();
    let prev = ctx.comm.ring_prev();
    for s in 0..n - 1 {
        b.add_barrier();
        let send_idx = (r + n - s - 1) % n;
        let recv_idx = (r + n - s - 2) % n;
        b.add(Box::new(SendEntry::new(next, tag(8, s), chunk(send_idx))));
        b.add(Box::new(RecvReduceEntry::new(
            prev,
            tag(8, s),
            chunk(recv_idx),
        )));
    }
    b.add_barrier();
    b.add(Box::new(CopyEntry::new(chunk(r), recv)));
}

fn build_alltoall_naive(b: &mut ScheduleBuilder, ctx: &SchedContext, desc: &OpDesc) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let esz = ctx.dtype.count_bytes();
    let count = desc.count;
    let send_chunk = |idx: usize| desc.send.byte_range(idx * count * esz, count * esz);
    let recv_chunk = |idx: usize| desc.recv.byte_range(idx * count * esz, count * esz);

    b.add(Box::new(CopyEntry::new(send_chunk(r), recv_chunk(r))));
    for peer in (0..n).filter(|&p| p != r) {
        b.add(Box::new(SendEntry::new(peer, tag(9, 0), send_chunk(peer))));
        b.add(Box::new(RecvEntry::new(peer, tag(9, 0), recv_chunk(peer))));
    }
}

/// Dissemination barrier: log2(n) token rounds at doubling distances.
fn build_barrier_ring(b: &mut ScheduleBuilder, ctx: &SchedContext) {
    let n = ctx.comm.size();
    let r = ctx.comm.rank();
    let mut dist = 1usize;
    let mut round = 0usize;
    while dist < n {
        b.add_barrier();
        b.add(Box::new(SyncEntry::new(
            (r + dist) % n,
            (r + n - dist) % n,
            tag(10, round),
        )));
        dist <<= 1;
        round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::host_context;

    #[test]
    fn unimplemented_combinations_are_reported() {
        let ctx = host_context(2);
        let desc = OpDesc {
            send: BufPtr::empty(),
            recv: BufPtr::empty(),
            count: 0,
            root: 0,
            counts: None,
        };
        let err = build_schedule(
            ctx,
            Algorithm::Allreduce(AllreduceAlgo::TwoDimensional),
            &desc,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SchedError::NotImplemented {
                coll: CollType::Allreduce,
                algo: "two_dimensional"
            }
        ));
    }

    #[test]
    fn cacheable_context_yields_a_fingerprint() {
        let mut ctx = host_context(1);
        ctx.cacheable = true;
        let mut buf = vec![0u8; 16];
        let desc = OpDesc {
            send: BufPtr::from_slice(&mut buf),
            recv: BufPtr::from_slice(&mut buf),
            count: 4,
            root: 0,
            counts: None,
        };
        let sched = build_schedule(ctx, Algorithm::Allreduce(AllreduceAlgo::Ring), &desc).unwrap();
        let fp = sched.fingerprint().unwrap();
        assert_eq!(fp.coll, CollType::Allreduce);
        assert_eq!(fp.count, 4);
    }
}
