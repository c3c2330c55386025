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

//! Tick driver
//!
//! This module ties the virtual clock, the event queue and the interrupt
//! controller together and provides the per-block control loop the CPU core
//! calls into.
//!
//! ## Block Loop
//!
//! ```text
//! CPU executes a block of N cycles
//!   -> step(N)
//!        report N cycles to the clock
//!        dispatch every event that came due
//!        at budget exhaustion: tick boundary (advance, rebase, tick handlers)
//!        ask the interrupt controller for a delivery
//!   <- StepOutcome { interrupt: Some(vector) => divert to the handler }
//! ```
//!
//! Device callbacks run synchronously inside `step` with an [`EventContext`]
//! giving them the queue and the interrupt lines, never the driver itself, so
//! they cannot re-enter the drain.

use super::config::{Config, DEFAULT_CYCLE_BUDGET};
use super::error::{CoreError, Result};
use super::event::{EventQueue, HandlerId, HandlerRegistry, DEFAULT_CAPACITY};
use super::interrupt::{Delivery, InterruptController};
use super::snapshot::{CoreSnapshot, SNAPSHOT_VERSION};
use super::timing::{Consumption, VirtualClock};

/// Device event callback, receives the event's argument
pub type EventCallback = Box<dyn FnMut(&mut EventContext<'_>, u32)>;

/// Callback run once per completed millisecond
pub type TickCallback = Box<dyn FnMut(&mut EventContext<'_>)>;

/// Registry slot of an event callback, empty while the callback runs
type CallbackSlot = Option<EventCallback>;

/// Identity of a registered tick handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickHandlerId(HandlerId);

/// What a device callback may touch while it runs
///
/// Scheduling from inside an event callback measures the delay from the
/// serviced event's deadline, so a periodic source stays on its period.
pub struct EventContext<'a> {
    clock: &'a VirtualClock,
    events: &'a mut EventQueue,
    pic: &'a mut InterruptController,
    handlers: &'a HandlerRegistry<CallbackSlot>,
    current: Option<HandlerId>,
}

impl EventContext<'_> {
    /// Handler whose event is being serviced (`None` in tick handlers)
    pub fn handler(&self) -> Option<HandlerId> {
        self.current
    }

    /// Current virtual time in milliseconds
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Read-only view of the clock
    pub fn clock(&self) -> &VirtualClock {
        self.clock
    }

    /// Schedule an event
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownHandler`] if `handler` is not registered
    /// - errors of [`EventQueue::schedule`]
    pub fn schedule(&mut self, handler: HandlerId, delay_ms: f64, argument: u32) -> Result<()> {
        if !self.handlers.contains(handler) {
            return Err(CoreError::UnknownHandler(handler.raw()));
        }
        self.events.schedule(self.clock, handler, delay_ms, argument)
    }

    /// Cancel every event of `handler`
    pub fn cancel_all(&mut self, handler: HandlerId) -> usize {
        self.events.cancel_all(handler)
    }

    /// Cancel events of `handler` carrying `argument`
    pub fn cancel_matching(&mut self, handler: HandlerId, argument: u32) -> usize {
        self.events.cancel_matching(handler, argument)
    }

    /// Assert an IRQ line
    pub fn activate_irq(&mut self, line: usize) {
        self.pic.activate_irq(line);
    }

    /// Deassert an IRQ line
    pub fn deactivate_irq(&mut self, line: usize) {
        self.pic.deactivate_irq(line);
    }

    /// Mask or unmask an IRQ line
    pub fn set_irq_mask(&mut self, line: usize, masked: bool) {
        self.pic.set_irq_mask(line, masked);
    }
}

/// Result of one [`TickDriver::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// How the clock accepted the reported cycles
    pub consumption: Consumption,
    /// Number of event callbacks invoked
    pub dispatched: usize,
    /// True if the step finished a millisecond
    pub tick_completed: bool,
    /// Interrupt the CPU must take, if any
    pub interrupt: Option<Delivery>,
}

/// Virtual-time and interrupt core
///
/// # Example
///
/// ```
/// use emutick::core::interrupt::InterruptController;
/// use emutick::core::system::TickDriver;
///
/// let mut driver = TickDriver::with_controller(1000, 512, InterruptController::pc_at());
/// let pit = driver.register_handler("pit", |ctx, _| {
///     ctx.activate_irq(0);
///     if let Some(me) = ctx.handler() {
///         ctx.schedule(me, 1.0, 0).unwrap();
///     }
/// });
/// driver.schedule(pit, 1.0, 0).unwrap();
///
/// let outcome = driver.step(1000);
/// assert!(outcome.tick_completed);
/// assert_eq!(outcome.interrupt.map(|d| d.vector), Some(0x08));
/// driver.end_of_interrupt(0);
/// ```
pub struct TickDriver {
    clock: VirtualClock,
    events: EventQueue,
    pic: InterruptController,
    /// Controller state restored by `reset`
    pic_power_on: InterruptController,
    handlers: HandlerRegistry<CallbackSlot>,
    tick_handlers: HandlerRegistry<TickCallback>,
    /// Budget applied at every tick boundary
    cycle_budget: i32,
    /// CPU interrupt flag
    interrupts_enabled: bool,
}

impl TickDriver {
    /// Create a driver from a configuration
    ///
    /// The first tick begins immediately with the configured budget.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for invalid settings.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let pic = InterruptController::from_config(&config.pic)?;
        Ok(Self::with_controller(
            config.timing.cycle_budget,
            config.timing.max_pending_events,
            pic,
        ))
    }

    /// Create a driver around an existing interrupt controller
    ///
    /// # Arguments
    ///
    /// * `cycle_budget` - Cycles per emulated millisecond
    /// * `capacity` - Event queue capacity, 0 for unbounded
    /// * `pic` - Interrupt controller in its power-on state
    pub fn with_controller(cycle_budget: i32, capacity: usize, pic: InterruptController) -> Self {
        let mut clock = VirtualClock::new();
        clock.begin_tick(cycle_budget);

        log::info!(
            "TickDriver: {} cycles/ms, {} IRQ lines, queue capacity {}",
            clock.cycle_budget_total(),
            pic.line_count(),
            capacity
        );

        Self {
            clock,
            events: EventQueue::new(capacity),
            pic_power_on: pic.clone(),
            pic,
            handlers: HandlerRegistry::new(),
            tick_handlers: HandlerRegistry::new(),
            cycle_budget,
            interrupts_enabled: true,
        }
    }

    /// Return to tick 0 with an empty queue and power-on interrupt state
    ///
    /// Registered handlers stay registered.
    pub fn reset(&mut self) {
        self.clock = VirtualClock::new();
        self.clock.begin_tick(self.cycle_budget);
        self.events.clear();
        self.pic = self.pic_power_on.clone();
        self.interrupts_enabled = true;
        log::info!("TickDriver: reset");
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register an event callback and return its identity
    pub fn register_handler<F>(&mut self, name: &str, callback: F) -> HandlerId
    where
        F: FnMut(&mut EventContext<'_>, u32) + 'static,
    {
        self.handlers.register(name, Some(Box::new(callback)))
    }

    /// Remove an event callback and cancel all of its pending events
    ///
    /// # Returns
    ///
    /// `true` if the handler was registered
    pub fn unregister_handler(&mut self, handler: HandlerId) -> bool {
        self.events.cancel_all(handler);
        self.handlers.unregister(handler).is_some()
    }

    /// Register a callback run at every tick boundary
    pub fn add_tick_handler<F>(&mut self, name: &str, callback: F) -> TickHandlerId
    where
        F: FnMut(&mut EventContext<'_>) + 'static,
    {
        TickHandlerId(self.tick_handlers.register(name, Box::new(callback)))
    }

    /// Remove a tick handler
    pub fn remove_tick_handler(&mut self, id: TickHandlerId) -> bool {
        self.tick_handlers.unregister(id.0).is_some()
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Schedule an event for a registered handler
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownHandler`] if `handler` is not registered
    /// - errors of [`EventQueue::schedule`]
    pub fn schedule(&mut self, handler: HandlerId, delay_ms: f64, argument: u32) -> Result<()> {
        if !self.handlers.contains(handler) {
            return Err(CoreError::UnknownHandler(handler.raw()));
        }
        self.events.schedule(&self.clock, handler, delay_ms, argument)
    }

    /// Cancel every event of `handler`
    pub fn cancel_all(&mut self, handler: HandlerId) -> usize {
        self.events.cancel_all(handler)
    }

    /// Cancel events of `handler` carrying `argument`
    pub fn cancel_matching(&mut self, handler: HandlerId, argument: u32) -> usize {
        self.events.cancel_matching(handler, argument)
    }

    // ========================================================================
    // Block Loop
    // ========================================================================

    /// Budget used from the next tick boundary on
    pub fn set_cycle_budget(&mut self, cycle_budget: i32) {
        self.cycle_budget = cycle_budget;
        log::debug!("TickDriver: cycle budget {} from next tick", cycle_budget);
    }

    /// Report cycles without dispatching
    pub fn report_consumed(&mut self, cycles: i32) -> Consumption {
        self.clock.report_consumed(cycles)
    }

    /// Dispatch every event that is due
    ///
    /// # Returns
    ///
    /// Number of callbacks invoked
    pub fn drain_ready(&mut self) -> usize {
        let Self {
            clock,
            events,
            pic,
            handlers,
            ..
        } = self;
        let clock = &*clock;

        events.drain_ready(clock, |queue, event| {
            let handler = event.handler();
            let Some(mut callback) = handlers.get_mut(handler).and_then(Option::take) else {
                log::warn!(
                    "TickDriver: dropped event for unregistered handler #{}",
                    handler.raw()
                );
                return;
            };
            let mut ctx = EventContext {
                clock,
                events: queue,
                pic: &mut *pic,
                handlers: &*handlers,
                current: Some(handler),
            };
            callback(&mut ctx, event.argument());
            if let Some(slot) = handlers.get_mut(handler) {
                *slot = Some(callback);
            }
        })
    }

    /// Close the current millisecond and open the next one
    fn tick_boundary(&mut self) {
        self.clock.advance_tick_boundary();
        self.events.rebase();
        self.clock.begin_tick(self.cycle_budget);

        let Self {
            clock,
            events,
            pic,
            handlers,
            tick_handlers,
            ..
        } = self;
        for (_, callback) in tick_handlers.iter_mut() {
            let mut ctx = EventContext {
                clock: &*clock,
                events: &mut *events,
                pic: &mut *pic,
                handlers: &*handlers,
                current: None,
            };
            callback(&mut ctx);
        }
    }

    /// Account for a block of executed cycles
    ///
    /// Reports the cycles, dispatches due events, crosses the tick boundary
    /// when the budget is spent and returns the interrupt to take, if any.
    /// Cycles past the end of the tick are clamped, so one step never spans
    /// more than one boundary.
    pub fn step(&mut self, cycles: i32) -> StepOutcome {
        let consumption = self.clock.report_consumed(cycles);
        let mut dispatched = self.drain_ready();

        let tick_completed = self.clock.is_tick_complete();
        if tick_completed {
            self.tick_boundary();
            dispatched += self.drain_ready();
        }

        let interrupt = if self.run_queue() {
            self.pic.last_delivery()
        } else {
            None
        };

        StepOutcome {
            consumption,
            dispatched,
            tick_completed,
            interrupt,
        }
    }

    /// Idle until the end of the current millisecond (halted CPU)
    pub fn finish_tick(&mut self) -> StepOutcome {
        let remaining = self.clock.cycle_budget_remaining();
        self.step(remaining)
    }

    /// Cycles the CPU may run before the driver needs control again
    ///
    /// The remaining budget, shortened to the earliest pending event, never
    /// less than 1.
    pub fn next_block_cycles(&self) -> i32 {
        let remaining = self.clock.cycle_budget_remaining();
        let cycles = match self.events.cycles_until_next(&self.clock) {
            Some(next) => remaining.min(next),
            None => remaining,
        };
        cycles.max(1)
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Set the CPU interrupt flag
    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.interrupts_enabled = enabled;
    }

    /// CPU interrupt flag
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    /// Acknowledge the next interrupt if the CPU accepts interrupts
    pub fn run_queue(&mut self) -> bool {
        self.interrupts_enabled && self.pic.run_queue()
    }

    /// Delivery selected by the last successful `run_queue`
    pub fn last_delivery(&self) -> Option<Delivery> {
        self.pic.last_delivery()
    }

    /// End the in-service state of a line
    pub fn end_of_interrupt(&mut self, line: usize) {
        self.pic.end_of_interrupt(line);
    }

    /// Assert an IRQ line from outside an event callback
    pub fn activate_irq(&mut self, line: usize) {
        self.pic.activate_irq(line);
    }

    /// Deassert an IRQ line from outside an event callback
    pub fn deactivate_irq(&mut self, line: usize) {
        self.pic.deactivate_irq(line);
    }

    /// Mask or unmask an IRQ line
    pub fn set_irq_mask(&mut self, line: usize, masked: bool) {
        self.pic.set_irq_mask(line, masked);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current virtual time in milliseconds
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn pic(&self) -> &InterruptController {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut InterruptController {
        &mut self.pic
    }

    /// Diagnostic name of a handler
    pub fn handler_name(&self, handler: HandlerId) -> Option<&str> {
        self.handlers.name(handler)
    }

    // ========================================================================
    // Save State
    // ========================================================================

    /// Capture the complete core state
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            version: SNAPSHOT_VERSION,
            clock: self.clock.state(),
            cycle_budget: self.cycle_budget,
            interrupts_enabled: self.interrupts_enabled,
            events: self.events.state(),
            pic: self.pic.state(),
        }
    }

    /// Restore a captured state
    ///
    /// Nothing changes unless the whole snapshot is accepted.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownHandler`] if an event names a handler that is
    ///   not registered
    /// - [`CoreError::Snapshot`] for inconsistent counters, unordered events
    ///   or a different interrupt topology
    pub fn restore(&mut self, snapshot: &CoreSnapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CoreError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if let Some(event) = snapshot
            .events
            .events
            .iter()
            .find(|e| !self.handlers.contains(e.handler()))
        {
            return Err(CoreError::UnknownHandler(event.handler().raw()));
        }

        let mut clock = self.clock.clone();
        clock.restore(snapshot.clock)?;
        let mut events = self.events.clone();
        events.restore(snapshot.events.clone())?;
        let mut pic = self.pic.clone();
        pic.restore(&snapshot.pic)?;

        self.clock = clock;
        self.events = events;
        self.pic = pic;
        self.cycle_budget = snapshot.cycle_budget;
        self.interrupts_enabled = snapshot.interrupts_enabled;

        log::info!(
            "TickDriver: restored tick {} with {} pending events",
            self.clock.elapsed_ticks(),
            self.events.len()
        );
        Ok(())
    }
}

impl Default for TickDriver {
    fn default() -> Self {
        Self::with_controller(
            DEFAULT_CYCLE_BUDGET,
            DEFAULT_CAPACITY,
            InterruptController::pc_at(),
        )
    }
}
