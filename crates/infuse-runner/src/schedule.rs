// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Task schedules
//!
//! A schedule is an immutable description of when one task should run:
//! validity mode, boot lockout, a periodicity rule, state predicates for
//! start and terminate, battery windows, and a runtime timeout. The
//! runner evaluates every declared schedule once per tick.
//!
//! Schedules serialize with `serde` so they can be stored in KV slots
//! and overridden in the field.

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;
use crate::states::{StateSnapshot, STATE_BITS};

/// When a schedule is eligible at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Validity {
    #[default]
    Always,
    /// Only while the application-active state bit is set
    Active,
    /// Only while the application-active state bit is clear
    Inactive,
    /// Always eligible, and immune to KV overrides
    Locked,
}

/// How often a schedule may start its task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Periodicity {
    /// No rate limit beyond the other gates
    #[default]
    None,
    /// Start on uptime seconds that are multiples of the period
    Fixed { period_s: u32 },
    /// At least `lockout_s` between consecutive starts. With
    /// `ignore_on_boot` the first start is allowed at any nonzero
    /// uptime.
    Lockout { lockout_s: u32, ignore_on_boot: bool },
    /// Start `delay_s` after the linked schedule last terminated
    After { linked: usize, delay_s: u32 },
}

/// One term of a state predicate expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePredicate {
    pub negate: bool,
    /// OR this term with the running result instead of AND. Ignored on
    /// the first term.
    pub or_with_previous: bool,
    pub state_bit: u16,
}

impl StatePredicate {
    pub const fn bit(state_bit: u16) -> Self {
        StatePredicate {
            negate: false,
            or_with_previous: false,
            state_bit,
        }
    }

    pub const fn not_bit(state_bit: u16) -> Self {
        StatePredicate {
            negate: true,
            or_with_previous: false,
            state_bit,
        }
    }

    pub const fn or_bit(state_bit: u16) -> Self {
        StatePredicate {
            negate: false,
            or_with_previous: true,
            state_bit,
        }
    }
}

/// Inclusive battery percentage window; a bound of 0 means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryWindow {
    pub lower: u8,
    pub upper: u8,
}

impl BatteryWindow {
    pub fn contains(&self, battery_pct: u8) -> bool {
        (self.lower == 0 || battery_pct >= self.lower)
            && (self.upper == 0 || battery_pct <= self.upper)
    }
}

/// Immutable description of when a task should run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub task_id: u8,
    pub validity: Validity,
    pub boot_lockout_minutes: u16,
    pub periodicity: Periodicity,
    pub states_start: Vec<StatePredicate>,
    pub states_terminate: Vec<StatePredicate>,
    /// Bypass a failing start predicate once this many 2-second units
    /// have elapsed since the last run; 0 disables the bypass
    pub states_start_timeout_2x_s: u16,
    pub battery_start: BatteryWindow,
    pub battery_terminate: BatteryWindow,
    /// Maximum runtime in seconds before a forced terminate; 0 means
    /// unlimited
    pub timeout_s: u32,
    /// Opaque per-task argument payload
    pub task_args: Vec<u8>,
    /// TDF logger destinations for this slot
    pub logging_mask: u8,
}

impl TaskSchedule {
    pub fn new(task_id: u8) -> Self {
        TaskSchedule {
            task_id,
            ..Default::default()
        }
    }

    /// Structural validation. An invalid schedule is skipped forever by
    /// the runner rather than killing its task.
    pub fn validate(&self, schedule_count: usize, own_index: usize) -> Result<(), RunnerError> {
        match self.periodicity {
            Periodicity::Fixed { period_s } if period_s == 0 => return Err(RunnerError::Invalid),
            Periodicity::Lockout { lockout_s, .. } if lockout_s == 0 => {
                return Err(RunnerError::Invalid)
            }
            Periodicity::After { linked, .. } if linked >= schedule_count || linked == own_index => {
                return Err(RunnerError::Invalid)
            }
            _ => {}
        }
        for window in [&self.battery_start, &self.battery_terminate] {
            if window.lower > 100 || window.upper > 100 {
                return Err(RunnerError::Invalid);
            }
            if window.lower != 0 && window.upper != 0 && window.lower > window.upper {
                return Err(RunnerError::Invalid);
            }
        }
        for predicate in self.states_start.iter().chain(&self.states_terminate) {
            if predicate.state_bit >= STATE_BITS {
                return Err(RunnerError::Invalid);
            }
        }
        Ok(())
    }
}

/// Evaluate a predicate list against a state snapshot. Returns `None`
/// for an empty list so callers can apply their fallthrough rule.
///
/// All referenced bits are read first, then combined left to right with
/// implicit AND except where a term sets `or_with_previous`. The first
/// term's OR flag is ignored.
pub fn evaluate_predicates(list: &[StatePredicate], snapshot: &StateSnapshot) -> Option<bool> {
    if list.is_empty() {
        return None;
    }
    let terms: Vec<bool> = list
        .iter()
        .map(|p| snapshot.test(p.state_bit) != p.negate)
        .collect();
    let mut result = terms[0];
    for (predicate, term) in list[1..].iter().zip(&terms[1..]) {
        if predicate.or_with_previous {
            result = result || *term;
        } else {
            result = result && *term;
        }
    }
    Some(result)
}
