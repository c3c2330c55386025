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

//! Error types for the timing and interrupt core
//!
//! Only a narrow set of operations can fail. Ordinary scheduling, cancellation
//! and dispatch never return an error under their documented preconditions;
//! consistency warnings such as cycle-budget overruns are logged and reported
//! through status values instead.

use thiserror::Error;

/// Errors reported by the core
#[derive(Debug, Error)]
pub enum CoreError {
    /// A duration-to-cycles conversion was requested before any cycle budget
    /// was established with `begin_tick`
    #[error("no cycle budget has been established; the tick driver is not initialized")]
    NoCycleBudget,

    /// A duration does not fit the 32-bit cycle range at the current rate
    ///
    /// `saturated` carries the clamped value for callers that want to continue.
    #[error("duration of {ms} ms is out of the representable cycle range (saturated to {saturated})")]
    DurationOutOfRange { ms: f64, saturated: i32 },

    /// Negative or non-finite scheduling delay
    #[error("invalid event delay: {0} ms")]
    InvalidDelay(f64),

    /// The event queue reached its configured capacity
    #[error("event queue full ({capacity} pending events)")]
    QueueFull { capacity: usize },

    /// IRQ line outside the controller topology
    #[error("IRQ line {line} does not exist")]
    InvalidLine { line: usize },

    /// Handler identity that was never issued by this registry
    #[error("unknown event handler #{0}")]
    UnknownHandler(u32),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Save-state encoding, decoding or validation failure
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
