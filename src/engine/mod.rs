//! Schedule execution engine: a single-threaded cooperative progress loop
//! per worker. `submit` arms a schedule without blocking, `test` polls
//! once, `wait` drives the loop until the schedule completes. The loop
//! round-robins over every live schedule so unrelated collectives make
//! forward progress independently. Cancellation is not supported: a
//! started schedule runs to completion or fatal error.

pub mod manager;

pub use manager::{CompletionHandle, WorkerManager};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::sched::{SchedError, Schedule, ScheduleCache};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error("unknown or already-reaped schedule ticket")]
    UnknownTicket,
}

/// Admission counter for device kernel launches. In serialization mode at
/// most one kernel launch is admitted per worker at a time; an entry that
/// loses the race reports `Again` and retries on the next poll.
pub struct LaunchLimiter {
    serialize: bool,
    in_flight: AtomicUsize,
}

impl LaunchLimiter {
    pub fn new(serialize: bool) -> Self {
        LaunchLimiter {
            serialize,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn try_claim(&self) -> bool {
        if !self.serialize {
            return true;
        }
        self.in_flight
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        if self.serialize {
            self.in_flight.store(0, Ordering::Release);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleTicket(u64);

/// One polling context driving a disjoint set of schedules.
pub struct Worker {
    index: usize,
    sched_cache: Arc<ScheduleCache>,
    running: Vec<(u64, Schedule)>,
    finished: HashMap<u64, Result<(), SchedError>>,
    next_ticket: u64,
}

impl Worker {
    pub fn new(index: usize, sched_cache: Arc<ScheduleCache>) -> Self {
        Worker {
            index,
            sched_cache,
            running: Vec::new(),
            finished: HashMap::new(),
            next_ticket: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Arms the schedule and registers it with the progress loop. Returns
    /// without driving it.
    pub fn submit(&mut self, mut schedule: Schedule) -> Result<ScheduleTicket, EngineError> {
        schedule.arm()?;
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.running.push((id, schedule));
        log::trace!("worker {} armed schedule {}", self.index, id);
        Ok(ScheduleTicket(id))
    }

    /// One round-robin pass over every live schedule.
    pub fn progress(&mut self) {
        let mut idx = 0;
        while idx < self.running.len() {
            let (id, schedule) = &mut self.running[idx];
            match schedule.progress() {
                Ok(true) => {
                    let id = *id;
                    let (_, schedule) = self.running.swap_remove(idx);
                    if schedule.is_cacheable() {
                        self.sched_cache.insert(schedule);
                    }
                    self.finished.insert(id, Ok(()));
                }
                Ok(false) => idx += 1,
                Err(e) => {
                    let id = *id;
                    self.running.swap_remove(idx);
                    log::error!("worker {} schedule {} failed: {}", self.index, id, e);
                    self.finished.insert(id, Err(e));
                }
            }
        }
    }

    /// Polls once. `Ok(true)` exactly once per completed ticket; a failed
    /// schedule's error surfaces here, also exactly once.
    pub fn test(&mut self, ticket: ScheduleTicket) -> Result<bool, EngineError> {
        if let Some(result) = self.finished.remove(&ticket.0) {
            result?;
            return Ok(true);
        }
        self.progress();
        match self.finished.remove(&ticket.0) {
            Some(result) => {
                result?;
                Ok(true)
            }
            None => {
                if self.running.iter().any(|(id, _)| *id == ticket.0) {
                    Ok(false)
                } else {
                    Err(EngineError::UnknownTicket)
                }
            }
        }
    }

    /// Cooperatively drives the loop until the ticket's schedule
    /// completes. Other registered schedules keep making progress.
    pub fn wait(&mut self, ticket: ScheduleTicket) -> Result<(), EngineError> {
        loop {
            if self.test(ticket)? {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::build::{build_schedule, OpDesc};
    use crate::sched::tests::host_contexts;
    use crate::sched::BufPtr;
    use crate::selection::{Algorithm, BarrierAlgo};

    #[test]
    fn limiter_serializes_claims() {
        let limiter = LaunchLimiter::new(true);
        assert!(limiter.try_claim());
        assert!(!limiter.try_claim());
        limiter.release();
        assert!(limiter.try_claim());
    }

    #[test]
    fn limiter_pass_through_when_disabled() {
        let limiter = LaunchLimiter::new(false);
        assert!(limiter.try_claim());
        assert!(limiter.try_claim());
    }

    #[test]
    fn single_rank_barrier_completes_immediately() {
        let ctx = host_contexts(1).remove(0);
        let desc = OpDesc {
            send: BufPtr::empty(),
            recv: BufPtr::empty(),
            count: 0,
            root: 0,
            counts: None,
        };
        let sched = build_schedule(ctx, Algorithm::Barrier(BarrierAlgo::Ring), &desc).unwrap();
        let mut worker = Worker::new(0, Arc::new(ScheduleCache::new()));
        let ticket = worker.submit(sched).unwrap();
        worker.wait(ticket).unwrap();
        assert!(matches!(
            worker.test(ticket),
            Err(EngineError::UnknownTicket)
        ));
    }

    #[test]
    fn independent_schedules_interleave() {
        // two single-rank barriers on one worker: neither blocks the other
        let ctx_a = host_contexts(1).remove(0);
        let ctx_b = host_contexts(1).remove(0);
        let desc = OpDesc {
            send: BufPtr::empty(),
            recv: BufPtr::empty(),
            count: 0,
            root: 0,
            counts: None,
        };
        let sched_a = build_schedule(ctx_a, Algorithm::Barrier(BarrierAlgo::Ring), &desc).unwrap();
        let sched_b = build_schedule(ctx_b, Algorithm::Barrier(BarrierAlgo::Ring), &desc).unwrap();
        let mut worker = Worker::new(0, Arc::new(ScheduleCache::new()));
        let ta = worker.submit(sched_a).unwrap();
        let tb = worker.submit(sched_b).unwrap();
        worker.wait(tb).unwrap();
        worker.wait(ta).unwrap();
    }
}
