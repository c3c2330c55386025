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

//! Core configuration
//!
//! Configuration is read from a TOML file. Missing sections and keys fall back
//! to a legacy PC/AT layout:
//!
//! ```toml
//! [timing]
//! cycle_budget = 3000
//! max_pending_events = 512
//!
//! [pic]
//! secondary = true
//! primary_vector_base = 8
//! secondary_vector_base = 112
//! priority = "fully-nested"
//! auto_eoi = false
//! unmasked = [0, 1, 2, 8]
//! ```

use super::error::{CoreError, Result};
use super::event::DEFAULT_CAPACITY;
use super::interrupt::PriorityMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default cycles per emulated millisecond
pub const DEFAULT_CYCLE_BUDGET: i32 = 3000;

/// Virtual time settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Cycles the CPU executes per emulated millisecond
    pub cycle_budget: i32,
    /// Event queue capacity, 0 for unbounded
    pub max_pending_events: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cycle_budget: DEFAULT_CYCLE_BUDGET,
            max_pending_events: DEFAULT_CAPACITY,
        }
    }
}

/// Interrupt controller layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PicConfig {
    /// Cascade a secondary 8-line bank behind line 2
    pub secondary: bool,
    pub primary_vector_base: u8,
    pub secondary_vector_base: u8,
    /// Priority mode of every bank
    pub priority: PriorityMode,
    /// Acknowledge without entering the in-service state
    pub auto_eoi: bool,
    /// Lines unmasked at power-on
    pub unmasked: Vec<usize>,
}

impl Default for PicConfig {
    fn default() -> Self {
        Self {
            secondary: true,
            primary_vector_base: 0x08,
            secondary_vector_base: 0x70,
            priority: PriorityMode::FullyNested,
            auto_eoi: false,
            unmasked: vec![0, 1, 2, 8],
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub pic: PicConfig,
}

impl Config {
    /// Parse and validate a configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use emutick::core::config::Config;
    ///
    /// let config = Config::load("emutick.toml")?;
    /// println!("{} cycles/ms", config.timing.cycle_budget);
    /// # Ok::<(), emutick::CoreError>(())
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Config: loaded {}", path.display());
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.timing.cycle_budget <= 0 {
            return Err(CoreError::Config(format!(
                "cycle_budget must be positive, got {}",
                self.timing.cycle_budget
            )));
        }

        let lines = if self.pic.secondary { 16 } else { 8 };
        if let Some(&line) = self.pic.unmasked.iter().find(|&&l| l >= lines) {
            return Err(CoreError::Config(format!(
                "unmasked line {} does not exist ({} lines)",
                line, lines
            )));
        }
        Ok(())
    }
}
