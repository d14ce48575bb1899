//! Dedicated worker threads. Each worker owns a disjoint set of schedules
//! and parks when idle; submission goes through a spin-guarded pending
//! queue with an unpark, completion comes back through a shared cell the
//! caller can block on.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::sched::{SchedError, Schedule, ScheduleCache};

use super::EngineError;

const PENDING: u8 = 0;
const DONE: u8 = 1;
const FAILED: u8 = 2;

struct CompletionCell {
    state: AtomicU8,
    error: Mutex<Option<SchedError>>,
}

pub struct CompletionHandle {
    cell: Arc<CompletionCell>,
}

impl CompletionHandle {
    /// Blocks until the schedule completes or fails.
    pub fn wait(self) -> Result<(), EngineError> {
        loop {
            match self.cell.state.load(Ordering::Acquire) {
                PENDING => thread::yield_now(),
                DONE => return Ok(()),
                _ => {
                    let err = self
                        .cell
                        .error
                        .lock()
                        .unwrap()
                        .take()
                        .expect("failed completion carries its error");
                    return Err(EngineError::Sched(err));
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.cell.state.load(Ordering::Acquire) != PENDING
    }
}

struct WorkerRuntime {
    index: usize,
    sched_cache: Arc<ScheduleCache>,
    pending: spin::Mutex<Vec<(Schedule, Arc<CompletionCell>)>>,
    new_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl WorkerRuntime {
    fn mainloop(&self) {
        let mut running: Vec<(Schedule, Arc<CompletionCell>)> = Vec::new();
        loop {
            let mut idx = 0;
            while idx < running.len() {
                let (schedule, cell) = &mut running[idx];
                match schedule.progress() {
                    Ok(true) => {
                        let (schedule, cell) = running.swap_remove(idx);
                        if schedule.is_cacheable() {
                            self.sched_cache.insert(schedule);
                        }
                        cell.state.store(DONE, Ordering::Release);
                    }
                    Ok(false) => idx += 1,
                    Err(e) => {
                        let (_, cell) = running.swap_remove(idx);
                        log::error!("worker {} schedule failed: {}", self.index, e);
                        *cell.error.lock().unwrap() = Some(e);
                        cell.state.store(FAILED, Ordering::Release);
                    }
                }
            }

            if Ok(true)
                == self.new_pending.compare_exchange(
                    true,
                    false,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
            {
                let mut pending = self.pending.lock();
                running.append(&mut pending);
            } else if running.is_empty() {
                if self.shutdown.load(Ordering::Acquire) {
                    log::trace!("worker {} shutting down", self.index);
                    return;
                }
                thread::park();
            }
        }
    }
}

struct WorkerHandle {
    runtime: Arc<WorkerRuntime>,
    join_handle: JoinHandle<()>,
}

pub struct WorkerManager {
    workers: Vec<WorkerHandle>,
}

impl WorkerManager {
    pub fn spawn(worker_count: usize, sched_cache: Arc<ScheduleCache>) -> Self {
        let workers = (0..worker_count)
            .map(|index| {
                let runtime = Arc::new(WorkerRuntime {
                    index,
                    sched_cache: Arc::clone(&sched_cache),
                    pending: spin::Mutex::new(Vec::new()),
                    new_pending: AtomicBool::new(false),
                    shutdown: AtomicBool::new(false),
                });
                let runtime_thread = Arc::clone(&runtime);
                let join_handle = thread::Builder::new()
                    .name(format!("ccrt-worker-{}", index))
                    .spawn(move || runtime_thread.mainloop())
                    .expect("spawn worker thread");
                WorkerHandle {
                    runtime,
                    join_handle,
                }
            })
            .collect();
        WorkerManager { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Arms the schedule and hands it to the worker's loop; never blocks
    /// on execution.
    pub fn submit(
        &self,
        worker: usize,
        mut schedule: Schedule,
    ) -> Result<CompletionHandle, EngineError> {
        schedule.arm()?;
        let handle = &self.workers[worker];
        let cell = Arc::new(CompletionCell {
            state: AtomicU8::new(PENDING),
            error: Mutex::new(None),
        });
        handle
            .runtime
            .pending
            .lock()
            .push((schedule, Arc::clone(&cell)));
        handle.runtime.new_pending.store(true, Ordering::Release);
        handle.join_handle.thread().unpark();
        Ok(CompletionHandle { cell })
    }

    /// Drains the workers and joins their threads.
    pub fn shutdown(self) {
        for handle in &self.workers {
            handle.runtime.shutdown.store(true, Ordering::Release);
            handle.join_handle.thread().unpark();
        }
        for handle in self.workers {
            let _ = handle.join_handle.join();
        }
    }
}
