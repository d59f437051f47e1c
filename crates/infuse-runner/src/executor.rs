// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Task executors
//!
//! Two ways to run a task body:
//!
//! - **Thread**: a dedicated thread with a configured stack size. The
//!   body runs once and the task is done when it returns.
//! - **Work queue**: a handler dispatched on a shared worker thread. The
//!   handler reschedules itself with a delay to stay alive and is done
//!   when it returns without rescheduling.
//!
//! Both receive a [`TerminateSignal`]. Termination is cooperative: the
//! runner raises the signal and the body is expected to notice at its
//! next wait or re-entry. Nothing here kills a stuck task.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::RunnerError;
use crate::schedule::TaskSchedule;

/// Cooperative cancellation token
///
/// Raised at most once per run with a termination code; re-armed by the
/// runner before each start.
#[derive(Clone, Default)]
pub struct TerminateSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    code: Mutex<Option<i32>>,
    cond: Condvar,
}

impl TerminateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. The first code raised wins.
    pub fn raise(&self, code: i32) {
        let mut state = self.inner.code.lock();
        if state.is_none() {
            *state = Some(code);
        }
        self.inner.cond.notify_all();
    }

    /// Termination code if raised
    pub fn check(&self) -> Option<i32> {
        *self.inner.code.lock()
    }

    /// Block until raised or `timeout` elapses. Returns the code when
    /// raised, `None` on timeout. Task bodies use this as their sleep.
    pub fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.code.lock();
        while state.is_none() {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }

    /// Re-arm for the next run
    pub fn reset(&self) {
        *self.inner.code.lock() = None;
    }
}

/// Thread task body
pub type ThreadBody = Arc<dyn Fn(&TaskSchedule, &TerminateSignal) + Send + Sync>;
/// Work-queue task handler, re-invoked per dispatch
pub type WorkHandler = Arc<dyn Fn(&mut WorkContext<'_>) + Send + Sync>;

/// How a task executes
#[derive(Clone)]
pub enum TaskExecutor {
    Thread { stack_size: usize, body: ThreadBody },
    WorkQueue { handler: WorkHandler },
}

/// A task declared to the runner
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_id: u8,
    pub name: &'static str,
    pub executor: TaskExecutor,
}

/// Handler-side view of one work-queue dispatch
pub struct WorkContext<'a> {
    pub schedule: &'a TaskSchedule,
    pub terminate: &'a TerminateSignal,
    /// Number of times this run has rescheduled itself so far
    pub reschedule_counter: u32,
    next_delay: Option<Duration>,
}

impl WorkContext<'_> {
    /// Run again after `delay`. Calling this keeps the task alive.
    pub fn reschedule(&mut self, delay: Duration) {
        self.next_delay = Some(delay);
    }
}

/// Completion flag shared between an executor and the runner
#[derive(Clone, Default)]
pub struct DoneFlag(Arc<AtomicBool>);

impl DoneFlag {
    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Spawn a thread-executor run
pub fn spawn_thread(
    name: &str,
    stack_size: usize,
    body: ThreadBody,
    schedule: TaskSchedule,
    terminate: TerminateSignal,
) -> Result<DoneFlag, RunnerError> {
    let done = DoneFlag::default();
    let flag = done.clone();
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_size)
        .spawn(move || {
            body(&schedule, &terminate);
            flag.mark();
        })?;
    Ok(done)
}

struct WorkItem {
    due: Instant,
    schedule: TaskSchedule,
    handler: WorkHandler,
    terminate: TerminateSignal,
    done: DoneFlag,
    reschedule_counter: u32,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    // Earliest due first
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due.cmp(&self.due)
    }
}

enum QueueMsg {
    Submit(Box<WorkItem>),
    /// Re-examine pending items; sent after a terminate is raised so the
    /// affected handler runs promptly instead of waiting out its delay
    Kick,
    Shutdown,
}

/// Shared worker thread dispatching [`TaskExecutor::WorkQueue`] items
pub struct WorkQueue {
    tx: Sender<QueueMsg>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new() -> Result<Self, RunnerError> {
        let (tx, rx) = bounded(64);
        let worker = std::thread::Builder::new()
            .name("infuse-workq".to_string())
            .spawn(move || worker_loop(rx))?;
        Ok(WorkQueue {
            tx,
            worker: Some(worker),
        })
    }

    /// Start a work-queue task run
    pub fn submit(
        &self,
        handler: WorkHandler,
        schedule: TaskSchedule,
        terminate: TerminateSignal,
    ) -> Result<DoneFlag, RunnerError> {
        let done = DoneFlag::default();
        let item = WorkItem {
            due: Instant::now(),
            schedule,
            handler,
            terminate,
            done: done.clone(),
            reschedule_counter: 0,
        };
        self.tx
            .send(QueueMsg::Submit(Box::new(item)))
            .map_err(|_| RunnerError::Executor("work queue stopped".into()))?;
        Ok(done)
    }

    /// Wake the worker after raising a terminate signal
    pub fn kick(&self) {
        let _ = self.tx.send(QueueMsg::Kick);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(QueueMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: Receiver<QueueMsg>) {
    let mut pending: BinaryHeap<Box<WorkItem>> = BinaryHeap::new();
    loop {
        // Terminated items are due immediately
        let now = Instant::now();
        let next_due = pending
            .iter()
            .map(|item| {
                if item.terminate.check().is_some() {
                    now
                } else {
                    item.due
                }
            })
            .min();

        let msg = match next_due {
            Some(due) => match rx.recv_timeout(due.saturating_duration_since(now)) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
        };
        match msg {
            Some(QueueMsg::Submit(item)) => pending.push(item),
            Some(QueueMsg::Kick) | None => {}
            Some(QueueMsg::Shutdown) => return,
        }

        // Dispatch everything due, including newly terminated items
        let now = Instant::now();
        let mut rest = BinaryHeap::new();
        while let Some(mut item) = pending.pop() {
            if item.due > now && item.terminate.check().is_none() {
                rest.push(item);
                continue;
            }
            let mut ctx = WorkContext {
                schedule: &item.schedule,
                terminate: &item.terminate,
                reschedule_counter: item.reschedule_counter,
                next_delay: None,
            };
            (item.handler)(&mut ctx);
            let next_delay = ctx.next_delay;
            match next_delay {
                Some(delay) if item.terminate.check().is_none() => {
                    item.due = Instant::now() + delay;
                    item.reschedule_counter += 1;
                    rest.push(item);
                }
                _ => item.done.mark(),
            }
        }
        pending = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_signal_raise_and_wait() {
        let signal = TerminateSignal::new();
        assert_eq!(signal.check(), None);
        assert_eq!(signal.wait(Duration::from_millis(10)), None);

        let waiter = signal.clone();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        signal.raise(7);
        signal.raise(9); // first code wins
        assert_eq!(handle.join().expect("join"), Some(7));
        assert_eq!(signal.check(), Some(7));

        signal.reset();
        assert_eq!(signal.check(), None);
    }

    #[test]
    fn test_thread_executor_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_inner = ran.clone();
        let body: ThreadBody = Arc::new(move |schedule, _| {
            assert_eq!(schedule.task_id, 4);
            ran_inner.store(true, Ordering::SeqCst);
        });
        let done = spawn_thread(
            "test-task",
            64 * 1024,
            body,
            TaskSchedule::new(4),
            TerminateSignal::new(),
        )
        .expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.is_done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(done.is_done());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_work_queue_reschedule_and_terminate() {
        let queue = WorkQueue::new().expect("queue");
        let entries = Arc::new(AtomicU32::new(0));
        let entries_inner = entries.clone();
        let handler: WorkHandler = Arc::new(move |ctx| {
            entries_inner.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.reschedule_counter, entries_inner.load(Ordering::SeqCst) - 1);
            if ctx.terminate.check().is_none() {
                ctx.reschedule(Duration::from_millis(5));
            }
        });
        let terminate = TerminateSignal::new();
        let done = queue
            .submit(handler, TaskSchedule::new(2), terminate.clone())
            .expect("submit");

        std::thread::sleep(Duration::from_millis(40));
        assert!(!done.is_done());
        assert!(entries.load(Ordering::SeqCst) >= 2);

        terminate.raise(1);
        queue.kick();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.is_done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(done.is_done());
    }

    #[test]
    fn test_work_queue_single_shot() {
        let queue = WorkQueue::new().expect("queue");
        let handler: WorkHandler = Arc::new(|_| {});
        let done = queue
            .submit(handler, TaskSchedule::new(1), TerminateSignal::new())
            .expect("submit");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.is_done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(done.is_done());
    }
}
