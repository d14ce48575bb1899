//! End-to-end scenarios: selection through schedule execution over the
//! in-process fabric and the fake driver.

use std::sync::Arc;

use ccrt::coll::{CollType, DataType, ReduceOp};
use ccrt::comm::{Communicator, CommunicatorId};
use ccrt::config::Config;
use ccrt::context::Context;
use ccrt::driver::fake::FakeDriver;
use ccrt::driver::{ContextId, DeviceId};
use ccrt::engine::Worker;
use ccrt::exchange::rendezvous::{BufferSlot, ExchangeSession, PeerSpec};
use ccrt::exchange::socket::UnixRendezvous;
use ccrt::exchange::{ExchangeError, HandleRegistry};
use ccrt::sched::build::OpDesc;
use ccrt::sched::BufPtr;
use ccrt::selection::{
    Algorithm, AllreduceAlgo, BufferPlacement, Forced, SelectorParam, StreamKind,
};
use ccrt::transport::local::local_fabric;
use ccrt::transport::TransportKind;

fn test_config() -> Config {
    let mut config = Config::default();
    // keep rendezvous endpoints unique per test process
    config.rendezvous.socket_prefix = format!("ccrt-hx-{}", std::process::id());
    config
}

fn f32_bufs(init: impl Fn(usize) -> f32, count: usize) -> (Vec<f32>, Vec<f32>) {
    ((0..count).map(init).collect(), vec![0f32; count])
}

fn buf_ptr(v: &mut [f32]) -> BufPtr {
    BufPtr::new(v.as_mut_ptr() as *mut u8, v.len() * 4)
}

#[test]
fn fallback_only_ring_allreduce_sums_across_four_ranks() {
    let n = 4;
    let count = 1024;
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(11), rank, n);
            let param = SelectorParam::host(
                CollType::Allreduce,
                count,
                DataType::Float32,
                Some(ReduceOp::Sum),
                &comm,
                TransportKind::Fabric,
            );
            // 4 KiB lands above the short-message boundary, so the
            // guaranteed-applicable tier must resolve to the ring tag
            let algo = context.selectors.select_fallback(&param).unwrap();
            assert_eq!(algo, Algorithm::Allreduce(AllreduceAlgo::Ring));

            let (mut send, mut recv) =
                f32_bufs(|j| (rank + 1) as f32 * (j % 13 + 1) as f32, count);
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root: 0,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            let rank_sum = (n * (n + 1) / 2) as f32;
            for (j, &v) in recv.iter().enumerate() {
                assert_eq!(v, rank_sum * (j % 13 + 1) as f32, "element {}", j);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn forced_topo_ring_on_three_ranks_falls_back_silently() {
    let n = 3;
    let count = 256;
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(12), rank, n);
            let mut param = SelectorParam::host(
                CollType::Allreduce,
                count,
                DataType::Float32,
                Some(ReduceOp::Sum),
                &comm,
                TransportKind::Fabric,
            );
            // size 3 is not an admissible topology; the hint must fall
            // back to an automatic choice without raising an error
            param.forced = Some(Forced {
                algo: Algorithm::Allreduce(AllreduceAlgo::TopoRing),
                strict: false,
            });
            let algo = context.select(&param).unwrap();
            assert_ne!(algo, Algorithm::Allreduce(AllreduceAlgo::TopoRing));

            let (mut send, mut recv) = f32_bufs(|j| (rank as f32) + (j as f32), count);
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root: 0,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            for (j, &v) in recv.iter().enumerate() {
                let expected: f32 = (0..n).map(|r| r as f32 + j as f32).sum();
                assert_eq!(v, expected);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn topo_ring_gpu_path_runs_exchange_and_kernel() {
    let n = 2;
    let count = 512;
    let driver = Arc::new(FakeDriver::new());
    let context = Arc::new(Context::new(test_config(), driver.clone()).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(13), rank, n);
            let mut param = SelectorParam::host(
                CollType::Allreduce,
                count,
                DataType::Float32,
                Some(ReduceOp::Sum),
                &comm,
                TransportKind::Fabric,
            );
            param.placement = BufferPlacement::Device;
            param.stream = Some(StreamKind::Gpu);
            // the whole constraint set holds, so the forced tag is honored
            param.forced = Some(Forced {
                algo: Algorithm::Allreduce(AllreduceAlgo::TopoRing),
                strict: true,
            });
            let algo = context.select(&param).unwrap();
            assert_eq!(algo, Algorithm::Allreduce(AllreduceAlgo::TopoRing));
            assert!(context.selectors.is_topo_ring(&param));

            let (mut send, mut recv) = f32_bufs(|j| j as f32, count);
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root: 0,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    // both ranks launched their ring kernel through the cached objects
    assert_eq!(driver.launches(), 2);
    assert_eq!(driver.modules_loaded(), 1);
    context.cache.teardown().unwrap();
}

#[test]
fn handle_exchange_pairs_registries_by_rank() {
    let config = test_config();
    let driver = Arc::new(FakeDriver::new());
    let slots0 = vec![BufferSlot {
        ptr: ccrt::driver::DevicePtr(0xa000),
        offset: 0,
    }];
    let slots1 = vec![BufferSlot {
        ptr: ccrt::driver::DevicePtr(0xb000),
        offset: 0,
    }];

    let t0 = UnixRendezvous::new(&config.rendezvous, "pair-test", 0, &[1]).unwrap();
    let t1 = UnixRendezvous::new(&config.rendezvous, "pair-test", 1, &[0]).unwrap();
    let interval = std::time::Duration::from_millis(1);
    let mut s0 = ExchangeSession::new(
        t0,
        0,
        &[PeerSpec {
            rank: 1,
            skipped: false,
        }],
        slots0,
        false,
        1000,
        interval,
    );
    let mut s1 = ExchangeSession::new(
        t1,
        1,
        &[PeerSpec {
            rank: 0,
            skipped: false,
        }],
        slots1,
        false,
        1000,
        interval,
    );

    let driver1 = Arc::clone(&driver);
    let peer = std::thread::spawn(move || {
        let mut registry = HandleRegistry::new();
        s1.run_to_completion(driver1.as_ref(), &mut registry).unwrap();
        registry
    });
    let mut registry = HandleRegistry::new();
    s0.run_to_completion(driver.as_ref(), &mut registry).unwrap();
    let peer_registry = peer.join().unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(peer_registry.len(), 1);
    assert_eq!(
        registry.get(1, 0).unwrap().ptr,
        ccrt::driver::DevicePtr(0xb000)
    );
    assert_eq!(
        peer_registry.get(0, 0).unwrap().ptr,
        ccrt::driver::DevicePtr(0xa000)
    );
}

#[test]
fn rendezvous_times_out_when_no_listener_ever_accepts() {
    let config = test_config();
    let driver = FakeDriver::new();
    // rank 1 connects toward rank 0, which never binds its endpoint
    let transport = UnixRendezvous::new(&config.rendezvous, "orphan-test", 1, &[0]).unwrap();
    let mut session = ExchangeSession::new(
        transport,
        1,
        &[PeerSpec {
            rank: 0,
            skipped: false,
        }],
        Vec::new(),
        false,
        200,
        std::time::Duration::from_micros(10),
    );
    let mut registry = HandleRegistry::new();
    let result = session.run_to_completion(&driver, &mut registry);
    assert!(matches!(
        result,
        Err(ExchangeError::Timeout {
            peer: 0,
            attempts: 200
        })
    ));
}

#[test]
fn cacheable_schedule_is_reused_from_the_fingerprint_cache() {
    let count = 64;
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());
    let comm = Communicator::new(CommunicatorId(14), 0, 1);
    let param = SelectorParam::host(
        CollType::Allreduce,
        count,
        DataType::Float32,
        Some(ReduceOp::Sum),
        &comm,
        TransportKind::Fabric,
    );
    let algo = context.select(&param).unwrap();

    let (mut send, mut recv) = f32_bufs(|j| j as f32, count);
    let desc = OpDesc {
        send: buf_ptr(&mut send),
        recv: buf_ptr(&mut recv),
        count,
        root: 0,
        counts: None,
    };
    let fingerprint = context.fingerprint(&param, algo, &desc);
    assert!(context.checkout_cached(&fingerprint).is_none());

    let endpoint = Box::new(local_fabric(1).remove(0));
    let sched = context
        .prepare(
            &param,
            algo,
            endpoint,
            &desc,
            0,
            DeviceId(0),
            ContextId(0),
            true,
        )
        .unwrap();
    let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
    let ticket = worker.submit(sched).unwrap();
    worker.wait(ticket).unwrap();
    assert_eq!(recv, send);

    // completed cacheable schedules transfer into the cache; checkout is
    // exclusive and the instance re-arms for an identical call
    let cached = context.checkout_cached(&fingerprint).unwrap();
    assert!(context.checkout_cached(&fingerprint).is_none());
    recv.iter_mut().for_each(|v| *v = 0.0);
    let ticket = worker.submit(cached).unwrap();
    worker.wait(ticket).unwrap();
    assert_eq!(recv, send);
    assert_eq!(context.sched_cache.len(), 1);
}

#[test]
fn bcast_delivers_the_root_buffer_to_every_rank() {
    let n = 4;
    let count = 96;
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(15), rank, n);
            let param = SelectorParam::host(
                CollType::Broadcast,
                count,
                DataType::Float32,
                None,
                &comm,
                TransportKind::Fabric,
            );
            let algo = context.select(&param).unwrap();
            let mut buf: Vec<f32> = if rank == 2 {
                (0..count).map(|j| 3.0 * j as f32).collect()
            } else {
                vec![0f32; count]
            };
            let desc = OpDesc {
                send: buf_ptr(&mut buf),
                recv: buf_ptr(&mut buf),
                count,
                root: 2,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();
            for (j, &v) in buf.iter().enumerate() {
                assert_eq!(v, 3.0 * j as f32);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn tree_reduce_accumulates_at_the_root() {
    let n = 4;
    let count = 48;
    let root = 1;
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(18), rank, n);
            let param = SelectorParam::host(
                CollType::Reduce,
                count,
                DataType::Float32,
                Some(ReduceOp::Max),
                &comm,
                TransportKind::Fabric,
            );
            let algo = context.select(&param).unwrap();

            let (mut send, mut recv) =
                f32_bufs(|j| ((rank * 7 + j * 3) % 23) as f32, count);
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            if rank == root {
                for (j, &v) in recv.iter().enumerate() {
                    let expected = (0..n)
                        .map(|r| ((r * 7 + j * 3) % 23) as f32)
                        .fold(f32::MIN, f32::max);
                    assert_eq!(v, expected, "element {}", j);
                }
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn allgatherv_ring_concatenates_contributions() {
    let n = 4;
    let counts: Vec<usize> = vec![8, 12, 4, 16];
    let total: usize = counts.iter().sum();
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        let counts = counts.clone();
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(19), rank, n);
            let param = SelectorParam::host(
                CollType::Allgatherv,
                counts[rank],
                DataType::Float32,
                None,
                &comm,
                TransportKind::Fabric,
            );
            let algo = context.select(&param).unwrap();

            let mut send: Vec<f32> = (0..counts[rank])
                .map(|j| (rank * 100 + j) as f32)
                .collect();
            let mut recv = vec![0f32; total];
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count: counts[rank],
                root: 0,
                counts: Some(counts.clone()),
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            let mut offset = 0;
            for (src, &c) in counts.iter().enumerate() {
                for j in 0..c {
                    assert_eq!(recv[offset + j], (src * 100 + j) as f32);
                }
                offset += c;
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn reduce_scatter_ring_spreads_reduced_chunks() {
    let n = 4;
    let count = 32; // per-rank output
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(16), rank, n);
            let param = SelectorParam::host(
                CollType::ReduceScatter,
                count,
                DataType::Float32,
                Some(ReduceOp::Sum),
                &comm,
                TransportKind::Fabric,
            );
            let algo = context.select(&param).unwrap();

            let total = count * n;
            let mut send: Vec<f32> = (0..total)
                .map(|j| (rank + 1) as f32 + j as f32)
                .collect();
            let mut recv = vec![0f32; count];
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root: 0,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            for (i, &v) in recv.iter().enumerate() {
                let j = rank * count + i;
                let expected: f32 = (0..n).map(|r| (r + 1) as f32 + j as f32).sum();
                assert_eq!(v, expected);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn alltoall_naive_transposes_chunks() {
    let n = 3;
    let count = 16; // per-pair chunk
    let context = Arc::new(Context::new(test_config(), Arc::new(FakeDriver::new())).unwrap());

    let mut joins = Vec::new();
    for (rank, endpoint) in local_fabric(n).into_iter().enumerate() {
        let context = Arc::clone(&context);
        joins.push(std::thread::spawn(move || {
            let comm = Communicator::new(CommunicatorId(17), rank, n);
            let param = SelectorParam::host(
                CollType::Alltoall,
                count,
                DataType::Float32,
                None,
                &comm,
                TransportKind::Fabric,
            );
            let algo = context.select(&param).unwrap();

            let total = count * n;
            // element j of the chunk destined to rank d encodes (rank, d, j)
            let mut send: Vec<f32> = (0..total)
                .map(|i| (rank * 1000 + (i / count) * 100 + i % count) as f32)
                .collect();
            let mut recv = vec![0f32; total];
            let desc = OpDesc {
                send: buf_ptr(&mut send),
                recv: buf_ptr(&mut recv),
                count,
                root: 0,
                counts: None,
            };
            let sched = context
                .prepare(
                    &param,
                    algo,
                    Box::new(endpoint),
                    &desc,
                    0,
                    DeviceId(0),
                    ContextId(0),
                    false,
                )
                .unwrap();
            let mut worker = Worker::new(0, Arc::clone(&context.sched_cache));
            let ticket = worker.submit(sched).unwrap();
            worker.wait(ticket).unwrap();

            for src in 0..n {
                for j in 0..count {
                    let got = recv[src * count + j];
                    let expected = (src * 1000 + rank * 100 + j) as f32;
                    assert_eq!(got, expected, "from rank {} element {}", src, j);
                }
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}
