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

//! emutick: virtual time and interrupt core for PC emulation
//!
//! This crate provides the timing backbone of a cycle-driven PC emulator: it
//! turns CPU cycle consumption into emulated milliseconds, fires device
//! callbacks at the right emulated moment and decides which hardware
//! interrupt the CPU takes next.
//!
//! # Architecture
//!
//! - [`core::timing`]: virtual clock (ticks, cycle budgets, `now()`)
//! - [`core::event`]: deadline-ordered event queue and handler identities
//! - [`core::interrupt`]: 8259-style banked priority interrupt controller
//! - [`core::system`]: tick driver tying the three together
//! - [`core::config`]: TOML configuration
//! - [`core::snapshot`]: save states
//!
//! # Example
//!
//! ```
//! use emutick::core::config::Config;
//! use emutick::core::system::TickDriver;
//!
//! let mut driver = TickDriver::new(&Config::default())?;
//! let rtc = driver.register_handler("rtc", |ctx, _| ctx.activate_irq(8));
//! driver.schedule(rtc, 0.5, 0)?;
//!
//! while driver.now() < 1.0 {
//!     let cycles = driver.next_block_cycles();
//!     if let Some(delivery) = driver.step(cycles).interrupt {
//!         // The CPU would run the handler at `delivery.vector` here
//!         driver.end_of_interrupt(delivery.line);
//!     }
//! }
//! # Ok::<(), emutick::CoreError>(())
//! ```
//!
//! # Error Handling
//!
//! Fallible operations return [`core::error::Result<T>`], an alias for
//! `Result<T, CoreError>`. Ordinary scheduling and dispatch never fail under
//! their documented preconditions.

pub mod core;

// Re-export commonly used types
pub use core::error::{CoreError, Result};
