// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Scheduler lifecycle through the public API: a thread task gated on a
// state bit, and a work-queue task cut short by its runtime timeout.

use infuse_runner::{
    Periodicity, StatePredicate, StateRegistry, TaskDefinition, TaskExecutor, TaskRunner,
    TaskSchedule, TerminateReason, ThreadBody, WorkHandler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tick the runner forward until the task leaves the running set
fn settle(runner: &mut TaskRunner, task_id: u8, mut uptime: u32) {
    while runner.task_running(task_id) {
        std::thread::sleep(Duration::from_millis(10));
        runner.iterate(uptime, 80).expect("iterate");
        uptime += 1;
        assert!(uptime < 500, "task {task_id} never terminated");
    }
}

#[test]
fn test_thread_task_follows_state_bit() {
    let registry = Arc::new(StateRegistry::new());
    let seen = Arc::new(Mutex::new(None));
    let body: ThreadBody = {
        let seen = Arc::clone(&seen);
        Arc::new(move |_schedule, signal| {
            *seen.lock() = signal.wait(Duration::from_secs(5));
        })
    };
    let definitions = vec![TaskDefinition {
        task_id: 1,
        name: "sensor",
        executor: TaskExecutor::Thread {
            stack_size: 64 * 1024,
            body,
        },
    }];
    let mut schedule = TaskSchedule::new(1);
    schedule.states_start = vec![StatePredicate::bit(3)];
    schedule.states_terminate = vec![StatePredicate::not_bit(3)];
    let mut runner =
        TaskRunner::new(definitions, vec![schedule], Arc::clone(&registry)).expect("runner");

    runner.iterate(1, 80).expect("iterate");
    assert!(!runner.task_running(1));

    registry.set(3);
    runner.iterate(2, 80).expect("iterate");
    assert!(runner.task_running(1));

    registry.clear(3);
    runner.iterate(3, 80).expect("iterate");
    settle(&mut runner, 1, 4);
    assert_eq!(*seen.lock(), Some(TerminateReason::States as i32));
}

#[test]
fn test_work_queue_task_times_out() {
    let registry = Arc::new(StateRegistry::new());
    let runs = Arc::new(AtomicU32::new(0));
    let code = Arc::new(Mutex::new(None));
    let handler: WorkHandler = {
        let runs = Arc::clone(&runs);
        let code = Arc::clone(&code);
        Arc::new(move |ctx| {
            if let Some(raised) = ctx.terminate.check() {
                *code.lock() = Some(raised);
                return;
            }
            runs.fetch_add(1, Ordering::SeqCst);
            ctx.reschedule(Duration::from_millis(5));
        })
    };
    let definitions = vec![TaskDefinition {
        task_id: 7,
        name: "poller",
        executor: TaskExecutor::WorkQueue { handler },
    }];
    let mut schedule = TaskSchedule::new(7);
    schedule.timeout_s = 2;
    // Keep the schedule from restarting the task once it times out
    schedule.periodicity = Periodicity::Lockout {
        lockout_s: 3600,
        ignore_on_boot: true,
    };
    let mut runner =
        TaskRunner::new(definitions, vec![schedule], Arc::clone(&registry)).expect("runner");

    runner.iterate(1, 80).expect("iterate");
    assert!(runner.task_running(7));
    std::thread::sleep(Duration::from_millis(50));

    runner.iterate(2, 80).expect("iterate");
    assert!(runner.task_running(7));

    runner.iterate(3, 80).expect("iterate");
    settle(&mut runner, 7, 4);
    assert!(runs.load(Ordering::SeqCst) >= 1);
    assert_eq!(*code.lock(), Some(TerminateReason::Timeout as i32));
}
