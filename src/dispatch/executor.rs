//! Execution of scanner units on worker threads.
//!
//! Units of one scan are submitted as a [`Group`]. Workers report each unit's result to the
//! group, and [`Group::join`] waits for all of them, failing units that exceed the unit
//! timeout. The timeout of a unit starts when a worker picks it up. A worker waits at most
//! the unit timeout for the body it runs, so a hung body never holds back the units queued
//! behind it.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use failure::err_msg;

use super::task::{UnitFailure, UnitResult};
use crate::error::Kind;

/// Body of a unit.
pub type Job = Box<dyn FnOnce() -> UnitResult + Send + 'static>;

/// A mutex with an associated condition variable.
#[derive(Debug, Default)]
struct Monitor<T> {
    state: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
enum Slot {
    Queued,
    Running(Instant),
    Done(Option<UnitResult>),
}

/// Identity of one unit in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub execution_id: String,
    pub scanner: String,
}

/// Completion tracker of a set of units submitted together.
#[derive(Debug)]
pub struct Group {
    units: Vec<UnitInfo>,
    timeout: Duration,
    slots: Monitor<Vec<Slot>>,
}

impl Group {
    /// Creates a group for the given units.
    pub fn new(units: Vec<UnitInfo>, timeout: Duration) -> Arc<Self> {
        let slots = units.iter().map(|_| Slot::Queued).collect();
        Arc::new(Self {
            units,
            timeout,
            slots: Monitor::new(slots),
        })
    }

    /// Units of the group, in submission order.
    pub fn units(&self) -> &[UnitInfo] {
        &self.units
    }

    fn started(&self, index: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            if let Slot::Queued = slot {
                *slot = Slot::Running(Instant::now());
            }
        }
        self.slots.cv.notify_all();
    }

    fn complete(&self, index: usize, result: UnitResult) {
        let mut slots = self.slots.lock();
        match slots.get_mut(index) {
            Some(Slot::Done(_)) => {
                debug!(
                    "ignoring late result of unit {}",
                    self.units[index].execution_id
                );
            }
            Some(slot) => *slot = Slot::Done(Some(result)),
            None => {}
        }
        self.slots.cv.notify_all();
    }

    /// Whether every unit finished or timed out.
    pub fn is_done(&self) -> bool {
        self.slots.lock().iter().all(|s| match s {
            Slot::Done(_) => true,
            _ => false,
        })
    }

    /// Waits for every unit and returns their results in submission order.
    ///
    /// A unit running for longer than the group timeout is reported as a `Kind::Timeout`
    /// failure; its eventual result is ignored.
    pub fn join(&self) -> Vec<UnitResult> {
        let mut slots = self.slots.lock();
        loop {
            let now = Instant::now();
            let mut next_deadline: Option<Instant> = None;
            for (index, slot) in slots.iter_mut().enumerate() {
                if let Slot::Running(start) = *slot {
                    let deadline = start + self.timeout;
                    if deadline <= now {
                        warn!(
                            "scanner `{}` exceeded the unit timeout",
                            self.units[index].scanner
                        );
                        *slot = Slot::Done(Some(Err(self.timeout_failure(index))));
                    } else {
                        next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                    }
                }
            }

            let done = slots.iter().all(|s| match s {
                Slot::Done(_) => true,
                _ => false,
            });
            if done {
                break;
            }

            slots = match next_deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    self.slots
                        .cv
                        .wait_timeout(slots, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => self
                    .slots
                    .cv
                    .wait(slots)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        slots
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| match slot {
                Slot::Done(result) => result
                    .take()
                    .unwrap_or_else(|| Err(self.lost_failure(index))),
                _ => Err(self.lost_failure(index)),
            })
            .collect()
    }

    fn timeout_failure(&self, index: usize) -> UnitFailure {
        let unit = &self.units[index];
        UnitFailure {
            execution_id: unit.execution_id.clone(),
            scanner: unit.scanner.clone(),
            error: Kind::Timeout {
                what: format!("scanner `{}`", unit.scanner),
                seconds: self.timeout.as_secs(),
            }
            .into(),
        }
    }

    fn lost_failure(&self, index: usize) -> UnitFailure {
        let unit = &self.units[index];
        UnitFailure {
            execution_id: unit.execution_id.clone(),
            scanner: unit.scanner.clone(),
            error: err_msg("the unit result was already collected"),
        }
    }
}

/// A unit ready to run on an executor.
pub struct Work {
    group: Arc<Group>,
    index: usize,
    job: Job,
}

impl Work {
    /// Creates the work of the unit at `index` in the group.
    pub fn new(group: Arc<Group>, index: usize, job: Job) -> Self {
        Self { group, index, job }
    }

    /// Identity of the unit.
    pub fn unit(&self) -> &UnitInfo {
        &self.group.units[self.index]
    }

    /// Runs the unit on the current thread and reports its result to the group.
    pub fn run(self) {
        let Work { group, index, job } = self;
        group.started(index);
        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => {
                let unit = &group.units[index];
                Err(UnitFailure {
                    execution_id: unit.execution_id.clone(),
                    scanner: unit.scanner.clone(),
                    error: err_msg(format!("the unit panicked: {}", panic_message(&*payload))),
                })
            }
        };
        group.complete(index, result);
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

/// Runs submitted units.
pub trait Executor: Send + Sync {
    /// Queues a unit for execution.
    fn execute(&self, work: Work);
}

/// Submits every unit of the group to the executor, in order.
pub fn submit_group(executor: &dyn Executor, group: &Arc<Group>, jobs: Vec<Job>) {
    for (index, job) in jobs.into_iter().enumerate() {
        executor.execute(Work::new(Arc::clone(group), index, job));
    }
}

#[derive(Default)]
struct Queue {
    work: VecDeque<Work>,
    shutdown: bool,
}

/// Fixed set of worker threads pulling units from a shared queue.
pub struct WorkerPool {
    queue: Arc<Monitor<Queue>>,
    threads: usize,
}

impl WorkerPool {
    /// Starts a pool with the given number of worker threads.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let queue = Arc::new(Monitor::new(Queue::default()));
        for id in 0..threads {
            let thread_queue = Arc::clone(&queue);
            let _ = thread::Builder::new()
                .name(format!("mastf-worker-{}", id))
                .spawn(move || worker(&thread_queue))
                .map_err(|e| error!("could not start worker thread: {}", e));
        }
        Self { queue, threads }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }
}

fn worker(queue: &Monitor<Queue>) {
    loop {
        let work = {
            let mut state = queue.lock();
            loop {
                if let Some(work) = state.work.pop_front() {
                    break work;
                }
                if state.shutdown {
                    return;
                }
                state = queue
                    .cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        debug!("running unit {}", work.unit().execution_id);
        run_supervised(work);
    }
}

/// Runs a unit on its own thread and waits for it at most the unit timeout.
///
/// A body still running after the timeout keeps its thread and the worker returns to the
/// queue. The group reports the unit as timed out and ignores its late result.
fn run_supervised(work: Work) {
    let timeout = work.group.timeout;
    let execution_id = work.unit().execution_id.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let slot = Arc::new(Mutex::new(Some(work)));
    let unit_slot = Arc::clone(&slot);

    let spawned = thread::Builder::new()
        .name(format!("mastf-unit-{}", execution_id))
        .spawn(move || {
            let work = unit_slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(work) = work {
                work.run();
            }
            let _ = done_tx.send(());
        });

    match spawned {
        Ok(_) => {
            if done_rx.recv_timeout(timeout).is_err() {
                warn!(
                    "unit {} is still running after {}s, moving on",
                    execution_id,
                    timeout.as_secs()
                );
            }
        }
        Err(e) => {
            warn!("could not start a thread for unit {}: {}", execution_id, e);
            let work = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(work) = work {
                work.run();
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, work: Work) {
        let mut state = self.queue.lock();
        state.work.push_back(work);
        self.queue.cv.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.lock().shutdown = true;
        self.queue.cv.notify_all();
    }
}
