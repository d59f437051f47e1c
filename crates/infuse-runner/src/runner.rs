// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Task runner
//!
//! The per-tick decision engine. `iterate` is driven at most once per
//! uptime second; for every declared schedule it decides whether the
//! schedule's task should start or terminate, consulting validity,
//! boot lockout, periodicity, battery windows, state predicates, and
//! the global rebooting bit.
//!
//! Several schedules may drive the same task id. The task starts when
//! any of them requests it and keeps running until every schedule
//! currently driving it has requested terminate; the last requester's
//! termination code is the one raised on the signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RunnerError;
use crate::executor::{spawn_thread, DoneFlag, TaskDefinition, TaskExecutor, TerminateSignal, WorkQueue};
use crate::schedule::{evaluate_predicates, Periodicity, TaskSchedule, Validity};
use crate::states::{StateRegistry, StateSnapshot, STATE_APPLICATION_ACTIVE, STATE_REBOOTING};
use crate::store::ScheduleStore;

/// Why a task was asked to terminate; raised as the signal code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TerminateReason {
    Rebooting = 1,
    /// Validity mode no longer matches application activity
    Invalidated = 2,
    Timeout = 3,
    Battery = 4,
    States = 5,
    /// Schedule table changed in KV
    Reload = 6,
    Shutdown = 7,
}

/// Mutable per-schedule bookkeeping
#[derive(Debug, Clone, Copy, Default)]
struct ScheduleState {
    last_run: u32,
    has_run: bool,
    last_terminate: u32,
    has_terminated: bool,
    runtime: u32,
    valid: bool,
}

struct RunningTask {
    terminate: TerminateSignal,
    done: DoneFlag,
    /// Schedules still driving the task
    drivers: Vec<usize>,
    /// Every schedule that drove this run, for terminate bookkeeping
    history: Vec<usize>,
    /// Signal raised; no schedule may rejoin until the task exits
    terminating: bool,
}

struct Tick {
    uptime_s: u32,
    battery_pct: u8,
    snapshot: StateSnapshot,
    rebooting: bool,
    active: bool,
}

/// Per-tick scheduler over declared tasks and schedules
pub struct TaskRunner {
    definitions: Vec<TaskDefinition>,
    schedules: Vec<TaskSchedule>,
    states: Vec<ScheduleState>,
    running: HashMap<u8, RunningTask>,
    registry: Arc<StateRegistry>,
    queue: WorkQueue,
    last_tick: Option<u32>,
    store: Option<StoreBinding>,
}

struct StoreBinding {
    store: ScheduleStore,
    defaults: Vec<TaskSchedule>,
    set_id: u16,
    reload_pending: Arc<AtomicBool>,
}

impl TaskRunner {
    pub fn new(
        definitions: Vec<TaskDefinition>,
        schedules: Vec<TaskSchedule>,
        registry: Arc<StateRegistry>,
    ) -> Result<Self, RunnerError> {
        for (idx, definition) in definitions.iter().enumerate() {
            if definitions[..idx]
                .iter()
                .any(|d| d.task_id == definition.task_id)
            {
                return Err(RunnerError::Invalid);
            }
        }
        let states = validate_schedules(&schedules, &definitions);
        Ok(TaskRunner {
            definitions,
            schedules,
            states,
            running: HashMap::new(),
            registry,
            queue: WorkQueue::new()?,
            last_tick: None,
            store: None,
        })
    }

    /// Construct with schedules resolved from a KV-backed store. Further
    /// KV changes to the schedule range terminate all tasks and reload
    /// the table on a following tick.
    pub fn with_store(
        definitions: Vec<TaskDefinition>,
        registry: Arc<StateRegistry>,
        store: ScheduleStore,
        defaults: Vec<TaskSchedule>,
        set_id: u16,
    ) -> Result<Self, RunnerError> {
        let schedules = store.load(&defaults, set_id)?;
        let reload_pending = Arc::new(AtomicBool::new(false));
        store.watch(reload_pending.clone());
        let mut runner = Self::new(definitions, schedules, registry)?;
        runner.store = Some(StoreBinding {
            store,
            defaults,
            set_id,
            reload_pending,
        });
        Ok(runner)
    }

    pub fn task_running(&self, task_id: u8) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn schedules(&self) -> &[TaskSchedule] {
        &self.schedules
    }

    /// One scheduler tick. Call at most once per second of uptime;
    /// duplicate seconds are ignored so fixed-period rules latch once.
    pub fn iterate(&mut self, uptime_s: u32, battery_pct: u8) -> Result<(), RunnerError> {
        if self.last_tick == Some(uptime_s) {
            return Ok(());
        }
        self.last_tick = Some(uptime_s);

        self.reap(uptime_s);
        if self.reload_if_pending()? {
            return Ok(());
        }

        let snapshot = self.registry.snapshot();
        let tick = Tick {
            uptime_s,
            battery_pct,
            rebooting: snapshot.test(STATE_REBOOTING),
            active: snapshot.test(STATE_APPLICATION_ACTIVE),
            snapshot,
        };

        for idx in 0..self.schedules.len() {
            if self.driving(idx) {
                self.states[idx].runtime = uptime_s.saturating_sub(self.states[idx].last_run);
                let reason = should_terminate(&self.schedules[idx], &self.states[idx], &tick);
                if let Some(reason) = reason {
                    self.request_terminate(idx, reason);
                }
            } else {
                // An out-of-range link marks the schedule invalid; the
                // checked lookup keeps the tick alive until should_start
                // skips it
                let linked = match self.schedules[idx].periodicity {
                    Periodicity::After { linked, .. } => self.states.get(linked).copied(),
                    _ => None,
                };
                if should_start(&self.schedules[idx], &self.states[idx], linked.as_ref(), &tick) {
                    self.start(idx, uptime_s)?;
                }
            }
        }
        Ok(())
    }

    /// Terminate everything and wait for task exit. Used at shutdown and
    /// before a schedule table reload.
    pub fn terminate_all(&mut self, reason: TerminateReason) {
        for task in self.running.values_mut() {
            task.drivers.clear();
            task.terminating = true;
            task.terminate.raise(reason as i32);
        }
        if !self.running.is_empty() {
            self.queue.kick();
        }
    }

    /// Whether schedule `idx` currently drives a running task
    fn driving(&self, idx: usize) -> bool {
        self.running
            .values()
            .any(|task| task.drivers.contains(&idx))
    }

    /// Record exits and drop finished tasks
    fn reap(&mut self, uptime_s: u32) {
        let mut finished = Vec::new();
        self.running.retain(|task_id, task| {
            if task.done.is_done() {
                finished.extend(task.history.iter().copied());
                log::debug!("task {task_id} exited");
                false
            } else {
                true
            }
        });
        for idx in finished {
            let state = &mut self.states[idx];
            state.last_terminate = uptime_s;
            state.has_terminated = true;
            state.runtime = 0;
        }
    }

    /// Apply a pending KV schedule reload. Running tasks are terminated
    /// first; the reload itself happens on a later tick once they have
    /// exited. Returns whether the tick was consumed.
    fn reload_if_pending(&mut self) -> Result<bool, RunnerError> {
        let Some(binding) = &self.store else {
            return Ok(false);
        };
        if !binding.reload_pending.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if !self.running.is_empty() {
            self.terminate_all(TerminateReason::Reload);
            return Ok(true);
        }
        let binding = match &self.store {
            Some(binding) => binding,
            None => return Ok(false),
        };
        let schedules = binding.store.load(&binding.defaults, binding.set_id)?;
        binding.reload_pending.store(false, Ordering::SeqCst);
        log::info!("schedule table reloaded ({} schedules)", schedules.len());
        self.states = validate_schedules(&schedules, &self.definitions);
        self.schedules = schedules;
        Ok(true)
    }

    fn start(&mut self, idx: usize, uptime_s: u32) -> Result<(), RunnerError> {
        let task_id = self.schedules[idx].task_id;
        if let Some(task) = self.running.get_mut(&task_id) {
            if task.terminating {
                // Wait for the previous run to exit
                return Ok(());
            }
            task.drivers.push(idx);
            task.history.push(idx);
        } else {
            let definition = match self.definitions.iter().find(|d| d.task_id == task_id) {
                Some(definition) => definition,
                None => return Err(RunnerError::NotFound),
            };
            let schedule = self.schedules[idx].clone();
            let terminate = TerminateSignal::new();
            let done = match &definition.executor {
                TaskExecutor::Thread { stack_size, body } => spawn_thread(
                    definition.name,
                    *stack_size,
                    body.clone(),
                    schedule,
                    terminate.clone(),
                )?,
                TaskExecutor::WorkQueue { handler } => {
                    self.queue.submit(handler.clone(), schedule, terminate.clone())?
                }
            };
            log::debug!("task {task_id} ({}) started by schedule {idx}", definition.name);
            self.running.insert(
                task_id,
                RunningTask {
                    terminate,
                    done,
                    drivers: vec![idx],
                    history: vec![idx],
                    terminating: false,
                },
            );
        }
        let state = &mut self.states[idx];
        state.last_run = uptime_s;
        state.has_run = true;
        state.runtime = 0;
        Ok(())
    }

    /// Withdraw schedule `idx` from its task; the signal is raised only
    /// once the last driver withdraws
    fn request_terminate(&mut self, idx: usize, reason: TerminateReason) {
        let task_id = self.schedules[idx].task_id;
        let Some(task) = self.running.get_mut(&task_id) else {
            return;
        };
        task.drivers.retain(|d| *d != idx);
        if task.drivers.is_empty() && !task.terminating {
            log::debug!("task {task_id} terminate requested ({reason:?})");
            task.terminating = true;
            task.terminate.raise(reason as i32);
            self.queue.kick();
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.terminate_all(TerminateReason::Shutdown);
    }
}

fn validate_schedules(
    schedules: &[TaskSchedule],
    definitions: &[TaskDefinition],
) -> Vec<ScheduleState> {
    schedules
        .iter()
        .enumerate()
        .map(|(idx, schedule)| {
            let known_task = definitions.iter().any(|d| d.task_id == schedule.task_id);
            let valid = known_task && schedule.validate(schedules.len(), idx).is_ok();
            if !valid {
                log::warn!("schedule {idx} invalid, skipped permanently");
            }
            ScheduleState {
                valid,
                ..Default::default()
            }
        })
        .collect()
}

fn validity_matches(validity: Validity, active: bool) -> bool {
    match validity {
        Validity::Always | Validity::Locked => true,
        Validity::Active => active,
        Validity::Inactive => !active,
    }
}

fn periodicity_passes(
    periodicity: &Periodicity,
    state: &ScheduleState,
    linked: Option<&ScheduleState>,
    uptime_s: u32,
) -> bool {
    match *periodicity {
        Periodicity::None => true,
        Periodicity::Fixed { period_s } => uptime_s % period_s == 0,
        Periodicity::Lockout {
            lockout_s,
            ignore_on_boot,
        } => {
            if !state.has_run {
                if ignore_on_boot {
                    uptime_s != 0
                } else {
                    uptime_s >= lockout_s
                }
            } else {
                uptime_s.saturating_sub(state.last_run) >= lockout_s
            }
        }
        Periodicity::After { delay_s, .. } => match linked {
            Some(linked) => {
                linked.has_terminated
                    && uptime_s.saturating_sub(linked.last_terminate) >= delay_s
            }
            None => false,
        },
    }
}

fn should_start(
    schedule: &TaskSchedule,
    state: &ScheduleState,
    linked: Option<&ScheduleState>,
    tick: &Tick,
) -> bool {
    if !state.valid || tick.rebooting {
        return false;
    }
    if tick.uptime_s < 60 * u32::from(schedule.boot_lockout_minutes) {
        return false;
    }
    if !validity_matches(schedule.validity, tick.active) {
        return false;
    }
    if !periodicity_passes(&schedule.periodicity, state, linked, tick.uptime_s) {
        return false;
    }
    if !schedule.battery_start.contains(tick.battery_pct) {
        return false;
    }
    match evaluate_predicates(&schedule.states_start, &tick.snapshot) {
        None | Some(true) => true,
        Some(false) => {
            // Predicate bypass after the configured timeout
            schedule.states_start_timeout_2x_s != 0
                && tick.uptime_s.saturating_sub(state.last_run)
                    >= 2 * u32::from(schedule.states_start_timeout_2x_s)
        }
    }
}

fn should_terminate(
    schedule: &TaskSchedule,
    state: &ScheduleState,
    tick: &Tick,
) -> Option<TerminateReason> {
    if tick.rebooting {
        return Some(TerminateReason::Rebooting);
    }
    if !validity_matches(schedule.validity, tick.active) {
        return Some(TerminateReason::Invalidated);
    }
    if schedule.timeout_s != 0 && state.runtime >= schedule.timeout_s {
        return Some(TerminateReason::Timeout);
    }
    if !schedule.battery_terminate.contains(tick.battery_pct) {
        return Some(TerminateReason::Battery);
    }
    if evaluate_predicates(&schedule.states_terminate, &tick.snapshot) == Some(true) {
        return Some(TerminateReason::States);
    }
    None
}
