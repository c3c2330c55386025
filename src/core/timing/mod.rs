// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Virtual Time Tracker
//!
//! Emulated time is derived from CPU cycle consumption, never from the host
//! clock. Each emulated millisecond (a *tick*) is given a cycle budget by the
//! CPU core; the position inside the tick is the fraction of that budget already
//! executed.
//!
//! ```text
//! now() = elapsed_ticks + cycles_consumed / cycle_budget_total
//!
//!  tick n                         tick n+1
//!  |------consumed------|---remaining---|
//!  ^ begin_tick(budget)                  ^ advance_tick_boundary()
//! ```
//!
//! `elapsed_ticks` is a 32-bit millisecond counter and wraps after roughly
//! 49.7 days of emulated time. The wrap is accepted behaviour: the event queue
//! keys its deadlines relative to the current tick, so ordering never depends
//! on the absolute counter.

use super::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Outcome of reporting consumed cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// The cycles fit in the current tick's budget
    Within,
    /// The report overran the budget; the block counter was clamped to the
    /// budget and `excess` cycles were dropped
    Clamped { excess: i32 },
    /// Negative report, ignored
    Rejected,
}

/// Serializable counters of a [`VirtualClock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
    pub elapsed_ticks: u32,
    pub cycle_budget_total: i32,
    pub cycle_budget_remaining: i32,
    pub cycles_consumed: i32,
    pub budget_established: bool,
}

/// Single source of truth for the current emulated moment
///
/// # Example
///
/// ```
/// use emutick::core::timing::VirtualClock;
///
/// let mut clock = VirtualClock::new();
/// clock.begin_tick(1000);
/// clock.report_consumed(250);
/// assert_eq!(clock.now(), 0.25);
///
/// clock.report_consumed(750);
/// clock.advance_tick_boundary();
/// assert_eq!(clock.now(), 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct VirtualClock {
    /// Emulated milliseconds since boot (wrapping)
    elapsed_ticks: u32,

    /// Cycle allowance of the current tick
    cycle_budget_total: i32,

    /// Cycles left in the current tick
    cycle_budget_remaining: i32,

    /// Cycles executed so far in the current tick
    cycles_consumed: i32,

    /// Set by the first `begin_tick`
    budget_established: bool,
}

impl VirtualClock {
    /// Create a clock at tick 0 with no cycle budget
    pub fn new() -> Self {
        Self {
            elapsed_ticks: 0,
            cycle_budget_total: 0,
            cycle_budget_remaining: 0,
            cycles_consumed: 0,
            budget_established: false,
        }
    }

    /// Start a tick with the given cycle budget
    ///
    /// Resets the block counters. A non-positive budget cannot express any
    /// progress and is raised to 1 with a warning.
    ///
    /// # Arguments
    ///
    /// * `cycle_budget` - Cycles the CPU will execute to advance one millisecond
    pub fn begin_tick(&mut self, cycle_budget: i32) {
        let budget = if cycle_budget <= 0 {
            log::warn!(
                "Clock: non-positive cycle budget {} at tick {}, using 1",
                cycle_budget,
                self.elapsed_ticks
            );
            1
        } else {
            cycle_budget
        };

        self.cycle_budget_total = budget;
        self.cycle_budget_remaining = budget;
        self.cycles_consumed = 0;
        self.budget_established = true;
        log::trace!("Clock: tick {} begins, budget={}", self.elapsed_ticks, budget);
    }

    /// Record cycles executed by the CPU
    ///
    /// The block counter never decreases. Overrunning the budget clamps the
    /// counter to the budget and is reported as [`Consumption::Clamped`];
    /// budget estimation is approximate, so this is a warning and not a fault.
    ///
    /// # Arguments
    ///
    /// * `cycles` - Cycles executed since the previous report
    pub fn report_consumed(&mut self, cycles: i32) -> Consumption {
        if cycles < 0 {
            log::warn!("Clock: negative cycle report {} ignored", cycles);
            return Consumption::Rejected;
        }

        let wanted = self.cycles_consumed as i64 + cycles as i64;
        let total = self.cycle_budget_total as i64;

        if wanted > total {
            let excess = (wanted - total).min(i32::MAX as i64) as i32;
            log::warn!(
                "Clock: {} cycles reported past the budget of {} at tick {}, clamping",
                excess,
                self.cycle_budget_total,
                self.elapsed_ticks
            );
            self.cycles_consumed = self.cycle_budget_total;
            self.cycle_budget_remaining = 0;
            return Consumption::Clamped { excess };
        }

        self.cycles_consumed = wanted as i32;
        self.cycle_budget_remaining = self.cycle_budget_total - self.cycles_consumed;
        Consumption::Within
    }

    /// Finish the current millisecond
    ///
    /// Increments `elapsed_ticks` (wrapping) and resets the block counters,
    /// keeping the current budget until the next `begin_tick`.
    pub fn advance_tick_boundary(&mut self) {
        self.elapsed_ticks = self.elapsed_ticks.wrapping_add(1);
        if self.elapsed_ticks == 0 {
            log::info!("Clock: elapsed tick counter wrapped");
        }
        self.cycles_consumed = 0;
        self.cycle_budget_remaining = self.cycle_budget_total;
    }

    /// Current virtual time in milliseconds
    ///
    /// Integer part is the tick count, fractional part the position inside the
    /// current tick. Side-effect free.
    pub fn now(&self) -> f64 {
        self.elapsed_ticks as f64 + self.tick_fraction()
    }

    /// Position inside the current tick
    ///
    /// In `[0, 1)` while the tick runs; reaches 1.0 only once the whole budget
    /// has been consumed, which coincides with the start of the next tick.
    pub fn tick_fraction(&self) -> f64 {
        if self.cycle_budget_total <= 0 {
            return 0.0;
        }
        self.cycles_consumed as f64 / self.cycle_budget_total as f64
    }

    /// Convert a duration into cycles at the current budget rate
    ///
    /// # Errors
    ///
    /// - [`CoreError::NoCycleBudget`] if no tick has ever begun
    /// - [`CoreError::DurationOutOfRange`] if the result does not fit in an
    ///   `i32`; the error carries the saturated value
    pub fn cycles_from_duration(&self, ms: f64) -> Result<i32> {
        if !self.budget_established {
            return Err(CoreError::NoCycleBudget);
        }

        let cycles = (ms * self.cycle_budget_total as f64).round();
        if cycles.is_nan() {
            return Err(CoreError::DurationOutOfRange { ms, saturated: 0 });
        }
        if cycles > i32::MAX as f64 {
            return Err(CoreError::DurationOutOfRange {
                ms,
                saturated: i32::MAX,
            });
        }
        if cycles < i32::MIN as f64 {
            return Err(CoreError::DurationOutOfRange {
                ms,
                saturated: i32::MIN,
            });
        }

        Ok(cycles as i32)
    }

    /// Emulated milliseconds since boot (wrapping)
    #[inline(always)]
    pub fn elapsed_ticks(&self) -> u32 {
        self.elapsed_ticks
    }

    /// Cycle allowance of the current tick
    #[inline(always)]
    pub fn cycle_budget_total(&self) -> i32 {
        self.cycle_budget_total
    }

    /// Cycles left in the current tick
    #[inline(always)]
    pub fn cycle_budget_remaining(&self) -> i32 {
        self.cycle_budget_remaining
    }

    /// Cycles executed so far in the current tick
    #[inline(always)]
    pub fn cycles_consumed(&self) -> i32 {
        self.cycles_consumed
    }

    /// True once `begin_tick` has been called at least once
    pub fn has_budget(&self) -> bool {
        self.budget_established
    }

    /// True when the current tick's budget is spent
    pub fn is_tick_complete(&self) -> bool {
        self.budget_established && self.cycle_budget_remaining == 0
    }

    /// Capture the counters for a save state
    pub fn state(&self) -> ClockState {
        ClockState {
            elapsed_ticks: self.elapsed_ticks,
            cycle_budget_total: self.cycle_budget_total,
            cycle_budget_remaining: self.cycle_budget_remaining,
            cycles_consumed: self.cycles_consumed,
            budget_established: self.budget_established,
        }
    }

    /// Restore counters captured by [`VirtualClock::state`]
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Snapshot`] if the counters break the block
    /// invariant `0 <= consumed <= total` or disagree on the remaining budget.
    pub fn restore(&mut self, state: ClockState) -> Result<()> {
        let consistent = state.cycles_consumed >= 0
            && state.cycles_consumed <= state.cycle_budget_total
            && state.cycle_budget_remaining == state.cycle_budget_total - state.cycles_consumed;
        if !consistent {
            return Err(CoreError::Snapshot(format!(
                "inconsistent clock counters: total={} remaining={} consumed={}",
                state.cycle_budget_total, state.cycle_budget_remaining, state.cycles_consumed
            )));
        }

        self.elapsed_ticks = state.elapsed_ticks;
        self.cycle_budget_total = state.cycle_budget_total;
        self.cycle_budget_remaining = state.cycle_budget_remaining;
        self.cycles_consumed = state.cycles_consumed;
        self.budget_established = state.budget_established;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_elapsed_ticks(&mut self, ticks: u32) {
        self.elapsed_ticks = ticks;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ============================================================================
    // Budget and Consumption
    // ============================================================================

    #[test]
    fn test_new_clock_is_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), 0.0);
        assert_eq!(clock.elapsed_ticks(), 0);
        assert!(!clock.has_budget());
    }

    #[test]
    fn test_begin_tick_resets_block_counters() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.report_consumed(400);
        clock.begin_tick(2000);

        assert_eq!(clock.cycle_budget_total(), 2000);
        assert_eq!(clock.cycle_budget_remaining(), 2000);
        assert_eq!(clock.cycles_consumed(), 0);
    }

    #[test]
    fn test_non_positive_budget_is_raised() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(0);
        assert_eq!(clock.cycle_budget_total(), 1);
        clock.begin_tick(-5);
        assert_eq!(clock.cycle_budget_total(), 1);
    }

    #[test]
    fn test_report_consumed_accumulates() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);

        assert_eq!(clock.report_consumed(100), Consumption::Within);
        assert_eq!(clock.report_consumed(150), Consumption::Within);
        assert_eq!(clock.cycles_consumed(), 250);
        assert_eq!(clock.cycle_budget_remaining(), 750);
        assert_eq!(clock.now(), 0.25);
    }

    #[test]
    fn test_report_consumed_clamps_overrun() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.report_consumed(900);

        assert_eq!(
            clock.report_consumed(300),
            Consumption::Clamped { excess: 200 }
        );
        assert_eq!(clock.cycles_consumed(), 1000);
        assert_eq!(clock.cycle_budget_remaining(), 0);
        assert!(clock.is_tick_complete());

        // Exhausted budget: every further report is clamped
        assert_eq!(
            clock.report_consumed(1),
            Consumption::Clamped { excess: 1 }
        );
        assert_eq!(clock.cycles_consumed(), 1000);
    }

    #[test]
    fn test_negative_report_never_decreases() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.report_consumed(500);

        assert_eq!(clock.report_consumed(-100), Consumption::Rejected);
        assert_eq!(clock.cycles_consumed(), 500);
    }

    // ============================================================================
    // Tick Boundaries
    // ============================================================================

    #[test]
    fn test_advance_tick_boundary() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.report_consumed(1000);
        let before = clock.now();

        clock.advance_tick_boundary();

        assert_eq!(clock.elapsed_ticks(), 1);
        assert_eq!(clock.cycles_consumed(), 0);
        assert_eq!(clock.cycle_budget_remaining(), 1000);
        assert_eq!(clock.now(), before, "tick completion is continuous");
    }

    #[test]
    fn test_now_strictly_increases_within_tick() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(3000);
        let mut last = clock.now();
        for _ in 0..100 {
            clock.report_consumed(7);
            let now = clock.now();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_elapsed_ticks_wraps() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.set_elapsed_ticks(u32::MAX);

        clock.advance_tick_boundary();

        assert_eq!(clock.elapsed_ticks(), 0);
        assert_eq!(clock.now(), 0.0);
    }

    // ============================================================================
    // Duration Conversion
    // ============================================================================

    #[test]
    fn test_cycles_from_duration_requires_budget() {
        let clock = VirtualClock::new();
        assert!(matches!(
            clock.cycles_from_duration(1.0),
            Err(CoreError::NoCycleBudget)
        ));
    }

    #[test]
    fn test_cycles_from_duration_uses_current_rate() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(3000);
        assert_eq!(clock.cycles_from_duration(0.5).unwrap(), 1500);
        assert_eq!(clock.cycles_from_duration(2.0).unwrap(), 6000);

        clock.begin_tick(1000);
        assert_eq!(clock.cycles_from_duration(0.5).unwrap(), 500);
    }

    #[test]
    fn test_cycles_from_duration_saturates() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1_000_000);

        match clock.cycles_from_duration(1.0e9) {
            Err(CoreError::DurationOutOfRange { saturated, .. }) => {
                assert_eq!(saturated, i32::MAX)
            }
            other => panic!("expected saturation, got {:?}", other),
        }
        match clock.cycles_from_duration(-1.0e9) {
            Err(CoreError::DurationOutOfRange { saturated, .. }) => {
                assert_eq!(saturated, i32::MIN)
            }
            other => panic!("expected saturation, got {:?}", other),
        }
        assert!(clock.cycles_from_duration(f64::NAN).is_err());
    }

    // ============================================================================
    // Save State
    // ============================================================================

    #[test]
    fn test_state_restore() {
        let mut clock = VirtualClock::new();
        clock.begin_tick(2000);
        clock.report_consumed(123);
        clock.advance_tick_boundary();
        clock.report_consumed(77);
        let state = clock.state();

        let mut restored = VirtualClock::new();
        restored.restore(state).unwrap();
        assert_eq!(restored.now(), clock.now());
        assert_eq!(restored.state(), state);
    }

    #[test]
    fn test_restore_rejects_inconsistent_counters() {
        let mut clock = VirtualClock::new();
        let state = ClockState {
            elapsed_ticks: 3,
            cycle_budget_total: 100,
            cycle_budget_remaining: 10,
            cycles_consumed: 200,
            budget_established: true,
        };
        assert!(clock.restore(state).is_err());
        assert_eq!(clock.elapsed_ticks(), 0);
    }

    proptest! {
        #[test]
        fn prop_duration_round_trip(budget in 100i32..100_000, ms in 0.0f64..1.0) {
            let mut clock = VirtualClock::new();
            clock.begin_tick(budget);
            let start = clock.now();

            let cycles = clock.cycles_from_duration(ms).unwrap();
            prop_assert_eq!(clock.report_consumed(cycles), Consumption::Within);

            let one_cycle = 1.0 / budget as f64;
            prop_assert!((clock.now() - start - ms).abs() <= one_cycle);
        }
    }
}
