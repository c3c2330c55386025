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

//! Save states
//!
//! A [`CoreSnapshot`] holds everything needed to resume the timing and
//! interrupt core at the exact emulated moment it was taken: the clock
//! counters, every pending event with its deadline, handler identity and
//! insertion sequence, and every interrupt line and bank mode.
//!
//! Handler identities are stored by value. Restoring into a driver therefore
//! requires the devices to register their handlers in the same order as in
//! the session that produced the snapshot.
//!
//! Snapshots are encoded with `bincode` (standard configuration).

use super::error::{CoreError, Result};
use super::event::EventQueueState;
use super::interrupt::InterruptState;
use super::timing::ClockState;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Format version written into every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable state of a [`TickDriver`](super::system::TickDriver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSnapshot {
    /// Format version, [`SNAPSHOT_VERSION`] when written
    pub version: u32,
    /// Clock counters
    pub clock: ClockState,
    /// Budget applied at each tick boundary
    pub cycle_budget: i32,
    /// CPU interrupt flag
    pub interrupts_enabled: bool,
    /// Pending events in dispatch order
    pub events: EventQueueState,
    /// Interrupt line and bank state
    pub pic: InterruptState,
}

impl CoreSnapshot {
    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoreError::Snapshot(format!("failed to encode snapshot: {}", e)))
    }

    /// Decode from bytes
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Snapshot`] for malformed data, trailing bytes or
    /// an unsupported version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (snapshot, read): (CoreSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CoreError::Snapshot(format!("failed to decode snapshot: {}", e)))?;

        if read != bytes.len() {
            return Err(CoreError::Snapshot(format!(
                "{} trailing bytes after snapshot",
                bytes.len() - read
            )));
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CoreError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Write to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes)?;
        log::info!("Snapshot: saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Read from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let snapshot = Self::from_bytes(&bytes)?;
        log::info!(
            "Snapshot: loaded {} ({} events pending)",
            path.display(),
            snapshot.events.events.len()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventQueue, HandlerId};
    use crate::core::interrupt::InterruptController;
    use crate::core::timing::VirtualClock;
    use tempfile::tempdir;

    fn sample() -> CoreSnapshot {
        let mut clock = VirtualClock::new();
        clock.begin_tick(1000);
        clock.report_consumed(400);

        let mut queue = EventQueue::new(16);
        queue.schedule(&clock, HandlerId::from_raw(0), 0.25, 7).unwrap();
        queue.schedule(&clock, HandlerId::from_raw(1), 3.5, 9).unwrap();

        let mut pic = InterruptController::pc_at();
        pic.activate_irq(1);

        CoreSnapshot {
            version: SNAPSHOT_VERSION,
            clock: clock.state(),
            cycle_budget: 1000,
            interrupts_enabled: true,
            events: queue.state(),
            pic: pic.state(),
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let snapshot = sample();
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(CoreSnapshot::from_bytes(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_rejects_truncated_and_trailing_data() {
        let bytes = sample().to_bytes().unwrap();
        assert!(CoreSnapshot::from_bytes(&bytes[..bytes.len() / 2]).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            CoreSnapshot::from_bytes(&padded),
            Err(CoreError::Snapshot(_))
        ));
    }

    #[test]
    fn test_rejects_other_version() {
        let mut snapshot = sample();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let bytes = snapshot.to_bytes().unwrap();
        assert!(CoreSnapshot::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let snapshot = sample();
        snapshot.save(&path).unwrap();
        assert_eq!(CoreSnapshot::load(&path).unwrap(), snapshot);
        assert!(matches!(
            CoreSnapshot::load(dir.path().join("missing.bin")),
            Err(CoreError::Io(_))
        ));
    }
}
