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

//! Event Queue
//!
//! Devices schedule callbacks at future points of virtual time. The queue keeps
//! pending events sorted by deadline, breaking ties by insertion order, so that
//! dispatch order is fully reproducible for a given sequence of schedule and
//! cancel calls and a given cycle-consumption trace.
//!
//! ## Deadline keys
//!
//! Deadlines are stored relative to the start of the current tick and shifted
//! down by one millisecond at every tick boundary ([`EventQueue::rebase`]).
//! An event due 2.5 ms after the current tick started has key `2.5`; after the
//! boundary its key becomes `1.5`. Absolute deadlines are recovered with
//! [`Event::deadline`]. Because keys never depend on the 32-bit tick counter,
//! its wrap cannot disturb ordering.
//!
//! ## Readiness
//!
//! An event is ready when `round(key * cycle_budget) <= cycles_consumed`, compared in
//! the cycle domain so that a delay converted with
//! [`VirtualClock::cycles_from_duration`] fires on exactly that cycle. The
//! rounding lets an event whose deadline falls between two cycles fire up to
//! half a cycle before `now()` reaches the exact deadline.
//!
//! ## Re-entrancy
//!
//! Callbacks run with mutable access to the queue and may schedule or cancel.
//! A delay scheduled from inside a callback is measured from the deadline of
//! the event being serviced, not from the current time, so periodic sources do
//! not accumulate dispatch latency. Such an event may still fire within the
//! running drain pass if its deadline moved strictly forward and is not past
//! the horizon captured at drain start; a zero-delay self-reschedule therefore
//! waits for the next pass instead of looping forever. A deferred event never
//! holds back the due events queued behind it.

use super::error::{CoreError, Result};
use super::timing::VirtualClock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default event capacity, matching the legacy fixed pool
pub const DEFAULT_CAPACITY: usize = 512;

/// Opaque identity of a registered event handler
///
/// Issued by [`HandlerRegistry::register`] and compared by value. Identities
/// are never reused within a registry, so a stale token can only miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(u32);

impl HandlerId {
    /// Raw registry index
    #[inline(always)]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild an identity from its raw index (save-state decoding)
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A pending callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Deadline relative to the start of the current tick, in milliseconds
    key: f64,

    /// Owner of the callback
    handler: HandlerId,

    /// Value passed to the callback
    argument: u32,

    /// Insertion sequence number (tie breaker)
    seq: u64,

    /// First drain pass this event may fire in
    #[serde(skip)]
    eligible_pass: u64,
}

impl Event {
    /// Handler identity this event belongs to
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Argument passed to the callback
    pub fn argument(&self) -> u32 {
        self.argument
    }

    /// Deadline relative to the start of the current tick
    pub fn key(&self) -> f64 {
        self.key
    }

    /// Insertion sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Absolute deadline in virtual milliseconds
    ///
    /// Follows the clock's tick counter, so it wraps together with it.
    pub fn deadline(&self, clock: &VirtualClock) -> f64 {
        clock.elapsed_ticks() as f64 + self.key
    }
}

/// Serializable contents of an [`EventQueue`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQueueState {
    pub events: Vec<Event>,
    pub next_seq: u64,
}

/// Deadline-ordered queue of pending events
///
/// # Example
///
/// ```
/// use emutick::core::event::{EventQueue, HandlerRegistry};
/// use emutick::core::timing::VirtualClock;
///
/// let mut registry: HandlerRegistry<&str> = HandlerRegistry::new();
/// let pit = registry.register("PIT0", "pit");
///
/// let mut clock = VirtualClock::new();
/// clock.begin_tick(1000);
///
/// let mut queue = EventQueue::new(0);
/// queue.schedule(&clock, pit, 0.5, 7).unwrap();
///
/// clock.report_consumed(500);
/// let mut fired = Vec::new();
/// queue.drain_ready(&clock, |_, event| fired.push(event.argument()));
/// assert_eq!(fired, vec![7]);
/// ```
#[derive(Debug, Clone)]
pub struct EventQueue {
    /// Pending events, ascending by key, insertion order among equal keys
    events: VecDeque<Event>,

    /// Maximum number of pending events (0 = unbounded)
    capacity: usize,

    /// Next insertion sequence number
    next_seq: u64,

    /// Drain pass counter
    pass: u64,

    /// Key of the event whose callback is running
    in_service: Option<f64>,
}

impl EventQueue {
    /// Create an empty queue
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of pending events, 0 for unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            next_seq: 0,
            pass: 0,
            in_service: None,
        }
    }

    /// Schedule `handler` to run `delay_ms` milliseconds from now
    ///
    /// Events for the same handler and argument may coexist; cancel first to
    /// replace one.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDelay`] for negative or non-finite delays
    /// - [`CoreError::QueueFull`] when the capacity is reached
    pub fn schedule(
        &mut self,
        clock: &VirtualClock,
        handler: HandlerId,
        delay_ms: f64,
        argument: u32,
    ) -> Result<()> {
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            log::warn!(
                "Event: rejected delay {} ms for handler #{}",
                delay_ms,
                handler.raw()
            );
            return Err(CoreError::InvalidDelay(delay_ms));
        }

        if self.capacity != 0 && self.events.len() >= self.capacity {
            log::error!("Event: queue full ({} events)", self.capacity);
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }

        let base = self.in_service.unwrap_or_else(|| clock.tick_fraction());
        let key = base + delay_ms;

        // No forward progress from inside a callback: hold until the next pass
        let eligible_pass = match self.in_service {
            Some(serviced) if key <= serviced => self.pass + 1,
            _ => 0,
        };

        let event = Event {
            key,
            handler,
            argument,
            seq: self.next_seq,
            eligible_pass,
        };
        self.next_seq += 1;

        let at = self.events.partition_point(|e| e.key <= key);
        self.events.insert(at, event);

        log::trace!(
            "Event: handler #{} arg={} scheduled at key {:.6} ({} pending)",
            handler.raw(),
            argument,
            key,
            self.events.len()
        );
        Ok(())
    }

    /// Remove every pending event of `handler`
    ///
    /// Idempotent; unknown handlers are a no-op.
    ///
    /// # Returns
    ///
    /// Number of events removed
    pub fn cancel_all(&mut self, handler: HandlerId) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.handler != handler);
        let removed = before - self.events.len();
        if removed > 0 {
            log::trace!("Event: cancelled {} events of handler #{}", removed, handler.raw());
        }
        removed
    }

    /// Remove pending events of `handler` carrying `argument`
    ///
    /// # Returns
    ///
    /// Number of events removed
    pub fn cancel_matching(&mut self, handler: HandlerId, argument: u32) -> usize {
        let before = self.events.len();
        self.events
            .retain(|e| !(e.handler == handler && e.argument == argument));
        let removed = before - self.events.len();
        if removed > 0 {
            log::trace!(
                "Event: cancelled {} events of handler #{} arg={}",
                removed,
                handler.raw(),
                argument
            );
        }
        removed
    }

    /// Dispatch every event that is due
    ///
    /// Pops the earliest event while it is ready and hands it to `dispatch`
    /// together with the queue, so the callback may schedule or cancel. Events
    /// deferred to a later pass are stepped over without blocking the due
    /// events behind them. Stops at the first event that is not yet due. Does
    /// nothing before the clock has a cycle budget.
    ///
    /// # Returns
    ///
    /// Number of events dispatched
    pub fn drain_ready<F>(&mut self, clock: &VirtualClock, mut dispatch: F) -> usize
    where
        F: FnMut(&mut EventQueue, &Event),
    {
        if !clock.has_budget() {
            return 0;
        }

        self.pass += 1;
        let horizon = clock.cycles_consumed() as f64;
        let budget = clock.cycle_budget_total() as f64;
        let mut dispatched = 0;

        loop {
            // Due events form a prefix; deferred ones inside it are skipped
            let next = self
                .events
                .iter()
                .take_while(|e| due_cycle(e.key, budget) <= horizon)
                .position(|e| e.eligible_pass <= self.pass);
            let Some(event) = next.and_then(|index| self.events.remove(index)) else {
                break;
            };

            log::trace!(
                "Event: dispatching handler #{} arg={} (key {:.6})",
                event.handler.raw(),
                event.argument,
                event.key
            );

            self.in_service = Some(event.key);
            dispatch(self, &event);
            dispatched += 1;
        }

        self.in_service = None;
        dispatched
    }

    /// Shift every key down by one millisecond
    ///
    /// Called exactly once per tick boundary, together with
    /// [`VirtualClock::advance_tick_boundary`].
    pub fn rebase(&mut self) {
        for event in self.events.iter_mut() {
            event.key -= 1.0;
        }
    }

    /// Cycles until the earliest pending event is due
    ///
    /// `None` when the queue is empty or no budget exists. Never returns less
    /// than 1, so the CPU always makes progress.
    pub fn cycles_until_next(&self, clock: &VirtualClock) -> Option<i32> {
        if !clock.has_budget() {
            return None;
        }
        let front = self.events.front()?;
        let due = due_cycle(front.key, clock.cycle_budget_total() as f64);
        let cycles = due - clock.cycles_consumed() as f64;
        Some(cycles.clamp(1.0, i32::MAX as f64) as i32)
    }

    /// Earliest pending event
    pub fn peek(&self) -> Option<&Event> {
        self.events.front()
    }

    /// Pending events in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Number of pending events for `handler`
    pub fn pending_for(&self, handler: HandlerId) -> usize {
        self.events.iter().filter(|e| e.handler == handler).count()
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Configured capacity (0 = unbounded)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pending event
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Capture the pending events for a save state
    pub fn state(&self) -> EventQueueState {
        EventQueueState {
            events: self.events.iter().cloned().collect(),
            next_seq: self.next_seq,
        }
    }

    /// Replace the contents with a captured state
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Snapshot`] if the keys are not non-decreasing,
    /// carry a non-finite key, or exceed the capacity. Equal keys are accepted
    /// in any sequence order, since rebasing can collapse nearby keys.
    pub fn restore(&mut self, state: EventQueueState) -> Result<()> {
        if self.capacity != 0 && state.events.len() > self.capacity {
            return Err(CoreError::Snapshot(format!(
                "{} events exceed the queue capacity of {}",
                state.events.len(),
                self.capacity
            )));
        }
        if state.events.iter().any(|e| !e.key.is_finite()) {
            return Err(CoreError::Snapshot("non-finite event deadline".to_string()));
        }
        let ordered = state
            .events
            .windows(2)
            .all(|w| w[0].key <= w[1].key);
        if !ordered {
            return Err(CoreError::Snapshot("events are not in deadline order".to_string()));
        }
        if state.events.iter().any(|e| e.seq >= state.next_seq) {
            return Err(CoreError::Snapshot(
                "event sequence number ahead of the queue counter".to_string(),
            ));
        }

        self.events = state
            .events
            .into_iter()
            .map(|mut e| {
                e.eligible_pass = 0;
                e
            })
            .collect();
        self.next_seq = state.next_seq;
        self.in_service = None;
        Ok(())
    }
}

/// Cycle within the current tick at which an event with `key` is due
///
/// Rounded the same way as [`VirtualClock::cycles_from_duration`], so a delay
/// and its cycle conversion agree exactly.
#[inline(always)]
fn due_cycle(key: f64, budget: f64) -> f64 {
    (key * budget).round()
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Registered handler and its diagnostic name
#[derive(Debug)]
struct HandlerSlot<H> {
    name: String,
    handler: H,
}

/// Issues [`HandlerId`]s and owns the callbacks they refer to
///
/// Slots are never reused, so identities stay unique for the life of the
/// registry.
#[derive(Debug)]
pub struct HandlerRegistry<H> {
    slots: Vec<Option<HandlerSlot<H>>>,
}

impl<H> HandlerRegistry<H> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register a handler and return its identity
    pub fn register(&mut self, name: &str, handler: H) -> HandlerId {
        let id = HandlerId(self.slots.len() as u32);
        self.slots.push(Some(HandlerSlot {
            name: name.to_string(),
            handler,
        }));
        log::debug!("Event: registered handler #{} '{}'", id.raw(), name);
        id
    }

    /// Remove a handler, returning it if it was registered
    pub fn unregister(&mut self, id: HandlerId) -> Option<H> {
        let slot = self.slots.get_mut(id.index())?.take()?;
        log::debug!("Event: unregistered handler #{} '{}'", id.raw(), slot.name);
        Some(slot.handler)
    }

    /// Mutable access to a registered handler
    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut H> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.handler)
    }

    /// Diagnostic name of a registered handler
    pub fn name(&self, id: HandlerId) -> Option<&str> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.name.as_str())
    }

    /// True if `id` refers to a live handler
    pub fn contains(&self, id: HandlerId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    /// Number of live handlers
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handlers in registration order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (HandlerId, &mut H)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            slot.as_mut()
                .map(|slot| (HandlerId(index as u32), &mut slot.handler))
        })
    }
}

impl<H> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BUDGET: i32 = 1000;

    fn setup() -> (VirtualClock, EventQueue) {
        let mut clock = VirtualClock::new();
        clock.begin_tick(BUDGET);
        (clock, EventQueue::new(0))
    }

    fn ids(n: u32) -> Vec<HandlerId> {
        (0..n).map(HandlerId::from_raw).collect()
    }

    /// Drain, recording (handler, argument) pairs
    fn drain(clock: &VirtualClock, queue: &mut EventQueue, log: &mut Vec<(u32, u32)>) -> usize {
        queue.drain_ready(clock, |_, e| log.push((e.handler().raw(), e.argument())))
    }

    /// Run the rest of the current tick and cross into the next one
    fn finish_tick(clock: &mut VirtualClock, queue: &mut EventQueue, log: &mut Vec<(u32, u32)>) {
        let remaining = clock.cycle_budget_remaining();
        clock.report_consumed(remaining);
        drain(clock, queue, log);
        clock.advance_tick_boundary();
        queue.rebase();
        clock.begin_tick(BUDGET);
        drain(clock, queue, log);
    }

    // ============================================================================
    // Scheduling and Ordering
    // ============================================================================

    #[test]
    fn test_schedule_keeps_deadline_order() {
        let (clock, mut queue) = setup();
        let h = ids(3);

        queue.schedule(&clock, h[0], 0.75, 0).unwrap();
        queue.schedule(&clock, h[1], 0.25, 0).unwrap();
        queue.schedule(&clock, h[2], 0.5, 0).unwrap();

        let keys: Vec<f64> = queue.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let (mut clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);

        queue.schedule(&clock, h, 5.0, 1).unwrap();
        queue.schedule(&clock, h, 5.0, 2).unwrap();

        let mut log = Vec::new();
        for _ in 0..5 {
            finish_tick(&mut clock, &mut queue, &mut log);
        }

        assert_eq!(clock.now(), 5.0);
        assert_eq!(log, vec![(0, 1), (0, 2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_at_future_event() {
        let (mut clock, mut queue) = setup();
        let h = ids(2);
        queue.schedule(&clock, h[0], 0.2, 0).unwrap();
        queue.schedule(&clock, h[1], 0.6, 0).unwrap();

        clock.report_consumed(300);
        let mut log = Vec::new();
        assert_eq!(drain(&clock, &mut queue, &mut log), 1);
        assert_eq!(log, vec![(0, 0)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_event_fires_on_exact_cycle() {
        let (mut clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        let delay_cycles = clock.cycles_from_duration(0.123).unwrap();
        queue.schedule(&clock, h, 0.123, 0).unwrap();

        let mut log = Vec::new();
        clock.report_consumed(delay_cycles - 1);
        assert_eq!(drain(&clock, &mut queue, &mut log), 0);
        clock.report_consumed(1);
        assert_eq!(drain(&clock, &mut queue, &mut log), 1);
    }

    #[test]
    fn test_readiness_rounds_to_nearest_cycle() {
        let (mut clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        queue.schedule(&clock, h, 0.1234, 0).unwrap();
        queue.schedule(&clock, h, 0.1236, 1).unwrap();

        let mut log = Vec::new();
        clock.report_consumed(123);
        assert_eq!(drain(&clock, &mut queue, &mut log), 1);
        assert!(clock.now() < 0.1234, "fires within half a cycle early");

        clock.report_consumed(1);
        assert_eq!(drain(&clock, &mut queue, &mut log), 1);
        assert_eq!(log, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn test_zero_delay_is_immediately_ready() {
        let (mut clock, mut queue) = setup();
        clock.report_consumed(100);
        queue.schedule(&clock, HandlerId::from_raw(0), 0.0, 9).unwrap();

        let mut log = Vec::new();
        assert_eq!(drain(&clock, &mut queue, &mut log), 1);
    }

    #[test]
    fn test_no_dispatch_without_budget() {
        let clock = VirtualClock::new();
        let mut queue = EventQueue::new(0);
        queue.schedule(&clock, HandlerId::from_raw(0), 0.0, 0).unwrap();

        let mut log = Vec::new();
        assert_eq!(drain(&clock, &mut queue, &mut log), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let (clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);

        assert!(matches!(
            queue.schedule(&clock, h, -1.0, 0),
            Err(CoreError::InvalidDelay(_))
        ));
        assert!(queue.schedule(&clock, h, f64::NAN, 0).is_err());
        assert!(queue.schedule(&clock, h, f64::INFINITY, 0).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let (clock, _) = setup();
        let mut queue = EventQueue::new(2);
        let h = HandlerId::from_raw(0);

        queue.schedule(&clock, h, 1.0, 0).unwrap();
        queue.schedule(&clock, h, 1.0, 1).unwrap();
        assert!(matches!(
            queue.schedule(&clock, h, 1.0, 2),
            Err(CoreError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    // ============================================================================
    // Cancellation
    // ============================================================================

    #[test]
    fn test_cancel_all_removes_every_argument() {
        let (clock, mut queue) = setup();
        let h = ids(2);
        queue.schedule(&clock, h[0], 0.1, 1).unwrap();
        queue.schedule(&clock, h[1], 0.2, 1).unwrap();
        queue.schedule(&clock, h[0], 0.3, 2).unwrap();

        assert_eq!(queue.cancel_all(h[0]), 2);
        assert_eq!(queue.pending_for(h[0]), 0);
        assert_eq!(queue.pending_for(h[1]), 1);

        // Idempotent
        assert_eq!(queue.cancel_all(h[0]), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_matching_filters_argument() {
        let (clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        queue.schedule(&clock, h, 0.1, 1).unwrap();
        queue.schedule(&clock, h, 0.2, 2).unwrap();
        queue.schedule(&clock, h, 0.3, 1).unwrap();

        assert_eq!(queue.cancel_matching(h, 1), 2);
        assert_eq!(queue.cancel_matching(h, 1), 0);
        assert_eq!(queue.iter().map(|e| e.argument()).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_cancel_unknown_handler_is_noop() {
        let (clock, mut queue) = setup();
        queue.schedule(&clock, HandlerId::from_raw(0), 0.1, 0).unwrap();
        assert_eq!(queue.cancel_all(HandlerId::from_raw(42)), 0);
        assert_eq!(queue.cancel_matching(HandlerId::from_raw(42), 0), 0);
        assert_eq!(queue.len(), 1);
    }

    // ============================================================================
    // Re-entrancy
    // ============================================================================

    #[test]
    fn test_zero_delay_self_reschedule_waits_for_next_pass() {
        let (mut clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        queue.schedule(&clock, h, 0.1, 0).unwrap();
        clock.report_consumed(500);

        let mut calls = 0;
        let fired = queue.drain_ready(&clock, |q, e| {
            calls += 1;
            q.schedule(&clock, e.handler(), 0.0, e.argument()).unwrap();
        });
        assert_eq!(fired, 1);
        assert_eq!(calls, 1);
        assert_eq!(queue.len(), 1);

        // Next pass picks it up (and defers its own reschedule again)
        let fired = queue.drain_ready(&clock, |q, e| {
            q.schedule(&clock, e.handler(), 0.0, e.argument()).unwrap();
        });
        assert_eq!(fired, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_deferred_event_does_not_block_due_events() {
        let (mut clock, mut queue) = setup();
        let h = ids(2);
        queue.schedule(&clock, h[0], 0.1, 0).unwrap();
        queue.schedule(&clock, h[1], 0.2, 0).unwrap();
        clock.report_consumed(500);

        // h[0] spins with zero delay; h[1] is due behind it
        let mut log = Vec::new();
        for _ in 0..3 {
            queue.drain_ready(&clock, |q, e| {
                log.push(e.handler().raw());
                if e.handler() == h[0] {
                    q.schedule(&clock, e.handler(), 0.0, 0).unwrap();
                }
            });
        }

        assert_eq!(log, vec![0, 1, 0, 0]);
        assert_eq!(queue.pending_for(h[1]), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_measures_from_serviced_deadline() {
        let (mut clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        queue.schedule(&clock, h, 0.1, 0).unwrap();

        // Serviced late, at 0.55: the periodic source catches up within the pass
        clock.report_consumed(550);
        let mut deadlines = Vec::new();
        queue.drain_ready(&clock, |q, e| {
            deadlines.push(e.key());
            q.schedule(&clock, e.handler(), 0.2, 0).unwrap();
        });

        assert_eq!(deadlines.len(), 3);
        assert!((deadlines[1] - 0.3).abs() < 1e-9);
        assert!((deadlines[2] - 0.5).abs() < 1e-9);
        assert!((queue.peek().unwrap().key() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_callback_can_cancel_pending_events() {
        let (mut clock, mut queue) = setup();
        let h = ids(2);
        queue.schedule(&clock, h[0], 0.1, 0).unwrap();
        queue.schedule(&clock, h[1], 0.2, 0).unwrap();
        clock.report_consumed(BUDGET / 2);

        let mut log = Vec::new();
        queue.drain_ready(&clock, |q, e| {
            log.push(e.handler().raw());
            q.cancel_all(HandlerId::from_raw(1));
        });
        assert_eq!(log, vec![0]);
        assert!(queue.is_empty());
    }

    // ============================================================================
    // Tick Boundaries
    // ============================================================================

    #[test]
    fn test_rebase_and_absolute_deadline() {
        let (mut clock, mut queue) = setup();
        queue.schedule(&clock, HandlerId::from_raw(0), 2.5, 0).unwrap();
        assert_eq!(queue.peek().unwrap().deadline(&clock), 2.5);

        clock.report_consumed(BUDGET);
        clock.advance_tick_boundary();
        queue.rebase();

        assert_eq!(queue.peek().unwrap().key(), 1.5);
        assert_eq!(queue.peek().unwrap().deadline(&clock), 2.5);
    }

    #[test]
    fn test_ordering_survives_tick_counter_wrap() {
        let (mut clock, mut queue) = setup();
        clock.set_elapsed_ticks(u32::MAX - 1);
        let h = ids(3);

        queue.schedule(&clock, h[0], 3.5, 0).unwrap();
        queue.schedule(&clock, h[1], 1.5, 0).unwrap();
        queue.schedule(&clock, h[2], 2.5, 0).unwrap();

        let mut log = Vec::new();
        for _ in 0..4 {
            finish_tick(&mut clock, &mut queue, &mut log);
        }

        assert_eq!(clock.elapsed_ticks(), 2, "counter wrapped");
        assert_eq!(log, vec![(1, 0), (2, 0), (0, 0)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cycles_until_next() {
        let (mut clock, mut queue) = setup();
        assert_eq!(queue.cycles_until_next(&clock), None);

        queue.schedule(&clock, HandlerId::from_raw(0), 0.25, 0).unwrap();
        assert_eq!(queue.cycles_until_next(&clock), Some(250));

        clock.report_consumed(300);
        assert_eq!(queue.cycles_until_next(&clock), Some(1));
    }

    // ============================================================================
    // Save State
    // ============================================================================

    #[test]
    fn test_state_restore_preserves_order() {
        let (clock, mut queue) = setup();
        let h = ids(2);
        queue.schedule(&clock, h[0], 0.5, 1).unwrap();
        queue.schedule(&clock, h[1], 0.5, 2).unwrap();
        queue.schedule(&clock, h[0], 0.1, 3).unwrap();
        let state = queue.state();

        let mut restored = EventQueue::new(0);
        restored.restore(state.clone()).unwrap();
        assert_eq!(restored.state(), state);

        // New insertions continue the sequence
        restored.schedule(&clock, h[1], 0.5, 4).unwrap();
        let args: Vec<u32> = restored.iter().map(|e| e.argument()).collect();
        assert_eq!(args, vec![3, 1, 2, 4]);
    }

    #[test]
    fn test_restore_rejects_unordered_events() {
        let (clock, mut queue) = setup();
        let h = HandlerId::from_raw(0);
        queue.schedule(&clock, h, 0.1, 0).unwrap();
        queue.schedule(&clock, h, 0.2, 0).unwrap();
        let mut state = queue.state();
        state.events.reverse();

        assert!(EventQueue::new(0).restore(state).is_err());
    }

    #[test]
    fn test_restore_accepts_equal_keys_in_any_sequence() {
        let h = HandlerId::from_raw(0);
        let event = |seq: u64| Event {
            key: 0.5,
            handler: h,
            argument: seq as u32,
            seq,
            eligible_pass: 0,
        };
        let state = EventQueueState {
            events: vec![event(3), event(1)],
            next_seq: 4,
        };

        let mut queue = EventQueue::new(0);
        queue.restore(state).unwrap();
        let args: Vec<u32> = queue.iter().map(|e| e.argument()).collect();
        assert_eq!(args, vec![3, 1]);
    }

    // ============================================================================
    // Handler Registry
    // ============================================================================

    #[test]
    fn test_registry_issues_unique_ids() {
        let mut registry = HandlerRegistry::new();
        let a = registry.register("a", 1);
        let b = registry.register("b", 2);
        assert_ne!(a, b);
        assert_eq!(registry.name(b), Some("b"));

        assert_eq!(registry.unregister(a), Some(1));
        assert_eq!(registry.unregister(a), None);
        assert!(!registry.contains(a));

        let c = registry.register("c", 3);
        assert_ne!(c, a, "identities are never reused");
        assert_eq!(registry.len(), 2);
        *registry.get_mut(c).unwrap() += 10;
        assert_eq!(registry.get_mut(c), Some(&mut 13));

        let live: Vec<(HandlerId, i32)> = registry.iter_mut().map(|(id, h)| (id, *h)).collect();
        assert_eq!(live, vec![(b, 2), (c, 13)]);
    }

    proptest! {
        #[test]
        fn prop_dispatch_order_is_sorted_and_stable(
            delays in proptest::collection::vec(0u8..20, 1..64)
        ) {
            let (mut clock, mut queue) = setup();
            let h = HandlerId::from_raw(0);
            for (i, d) in delays.iter().enumerate() {
                queue.schedule(&clock, h, *d as f64 * 0.05, i as u32).unwrap();
            }

            clock.report_consumed(BUDGET);
            let mut fired = Vec::new();
            queue.drain_ready(&clock, |_, e| fired.push((e.key(), e.argument())));

            prop_assert_eq!(fired.len(), delays.len());
            for pair in fired.windows(2) {
                prop_assert!(pair[0].0 <= pair[1].0);
                if pair[0].0 == pair[1].0 {
                    prop_assert!(pair[0].1 < pair[1].1);
                }
            }
        }

        #[test]
        fn prop_every_event_fires_exactly_once(
            delays in proptest::collection::btree_set(1u32..4000, 1..50)
        ) {
            let (mut clock, mut queue) = setup();
            let h = HandlerId::from_raw(0);
            for d in &delays {
                queue.schedule(&clock, h, *d as f64 / 1000.0, *d).unwrap();
            }

            let mut log = Vec::new();
            for _ in 0..5 {
                finish_tick(&mut clock, &mut queue, &mut log);
            }

            prop_assert!(queue.is_empty());
            let fired: Vec<u32> = log.iter().map(|(_, arg)| *arg).collect();
            let expected: Vec<u32> = delays.iter().copied().collect();
            prop_assert_eq!(fired, expected);
        }

        #[test]
        fn prop_cancel_all_is_idempotent(
            owners in proptest::collection::vec(0u32..4, 0..40)
        ) {
            let (clock, mut queue) = setup();
            for (i, owner) in owners.iter().enumerate() {
                queue.schedule(&clock, HandlerId::from_raw(*owner), i as f64 * 0.01, 0).unwrap();
            }
            let mut twice = queue.clone();

            queue.cancel_all(HandlerId::from_raw(1));
            twice.cancel_all(HandlerId::from_raw(1));
            twice.cancel_all(HandlerId::from_raw(1));

            prop_assert_eq!(queue.state(), twice.state());
        }
    }
}
