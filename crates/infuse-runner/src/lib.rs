// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Task runner for the Infuse telemetry core
//!
//! Declares tasks (thread or work-queue bodies) and schedules (when
//! each task should run), then drives start/terminate decisions from a
//! once-per-second tick:
//!
//! ```text
//!  StateRegistry ----.
//!  battery level ----+--> TaskRunner::iterate --> start / terminate
//!  KV schedules -----'          |
//!                               v
//!                 Thread executor / WorkQueue
//!                     (TerminateSignal)
//! ```
//!
//! Schedule tables can live in an `infuse-kv` store so deployments can
//! override the compiled-in defaults; KV changes trigger a coordinated
//! terminate-and-reload.

mod error;
mod executor;
mod runner;
mod schedule;
mod states;
mod store;

pub use error::RunnerError;
pub use executor::{
    DoneFlag, TaskDefinition, TaskExecutor, TerminateSignal, ThreadBody, WorkContext, WorkHandler,
    WorkQueue,
};
pub use runner::{TaskRunner, TerminateReason};
pub use schedule::{
    evaluate_predicates, BatteryWindow, Periodicity, StatePredicate, TaskSchedule, Validity,
};
pub use states::{
    StateRegistry, StateSnapshot, STATE_APPLICATION_ACTIVE, STATE_BITS, STATE_REBOOTING,
};
pub use store::{ScheduleStore, SCHEDULE_SCHEMA_VERSION};
