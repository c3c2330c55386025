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

//! 8259-style Priority Interrupt Controller
//!
//! The controller models a set of IRQ lines grouped into banks. Inside a bank
//! a lower line number means a higher priority. A bank may be cascaded into a
//! line of another bank; that line then stands for the whole secondary bank in
//! its parent's priority order, as on the PC/AT where lines 8-15 are resolved
//! at the priority of line 2.
//!
//! ## Line States
//!
//! ```text
//!            activate_irq            run_queue              end_of_interrupt
//!   Idle ----------------> Pending ------------> InService ----------------> Idle
//!    ^                       |  ^
//!    |     deactivate_irq    |  | set_irq_mask(false)
//!    +-----------------------+  |
//!                          Masked (requested while masked)
//! ```
//!
//! Each line carries three flags: *requested* (the latched request),
//! *masked* and *in service*. A masked line is never selected, and unmasking
//! an already requested line makes it eligible without a new request.
//!
//! ## Priority Modes
//!
//! - `Exclusive`: any in-service line blocks its whole bank, so at most one
//!   line per bank is in service.
//! - `FullyNested`: an in-service line blocks itself and every lower-priority
//!   line; higher-priority lines may nest (8259 power-on behaviour).
//! - `SpecialMask`: in-service state does not block other lines.
//!
//! ## Legacy Layout
//!
//! ```text
//! Line | Bank      | Vector | Typical source
//! -----|-----------|--------|---------------------------
//! 0    | primary   | 0x08   | PIT channel 0
//! 1    | primary   | 0x09   | Keyboard
//! 2    | primary   | 0x0A   | Cascade (secondary bank)
//! 3-7  | primary   | 0x0B-F | Serial, sound, floppy, printer
//! 8    | secondary | 0x70   | RTC
//! 9-15 | secondary | 0x71-7 | Redirected IRQ 2, mouse, FPU, disks
//! ```

use super::config::PicConfig;
use super::error::{CoreError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Maximum number of lines in one bank (register views are 32 bits wide)
pub const MAX_BANK_LINES: usize = 32;

bitflags! {
    /// Per-line state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LineFlags: u8 {
        /// Request latched by `activate_irq`
        const REQUESTED = 1 << 0;
        /// Line masked by `set_irq_mask`
        const MASKED = 1 << 1;
        /// Acknowledged by the CPU, waiting for end-of-interrupt
        const IN_SERVICE = 1 << 2;
    }
}

/// How in-service lines block other lines of their bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityMode {
    /// Any in-service line blocks the whole bank
    #[default]
    Exclusive,
    /// In-service line blocks itself and lower priorities
    FullyNested,
    /// In-service lines never block other lines
    SpecialMask,
}

/// When a line's request latch is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Acknowledgement clears the request
    #[default]
    Edge,
    /// Request stays asserted until `deactivate_irq`
    Level,
}

/// Observable state of one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Not requested, not in service
    Idle,
    /// Requested while masked
    Masked,
    /// Requested, unmasked, not in service
    Pending,
    /// Acknowledged, waiting for end-of-interrupt
    InService,
}

/// Interrupt handed to the CPU by [`InterruptController::run_queue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Global line number
    pub line: usize,
    /// Interrupt vector (bank vector base + line offset)
    pub vector: u8,
}

/// Static description of one bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankConfig {
    /// Number of lines (1..=32)
    pub lines: usize,
    /// Vector of the bank's first line
    pub vector_base: u8,
    /// Global line of another bank this bank signals through
    pub cascade: Option<usize>,
    /// Blocking behaviour of in-service lines
    pub priority: PriorityMode,
    /// Acknowledge without entering the in-service state
    pub auto_eoi: bool,
}

impl BankConfig {
    /// Bank of `lines` lines with default modes
    pub fn new(lines: usize, vector_base: u8) -> Self {
        Self {
            lines,
            vector_base,
            cascade: None,
            priority: PriorityMode::default(),
            auto_eoi: false,
        }
    }

    /// Cascade this bank into `line` of a previously declared bank
    pub fn cascaded_into(mut self, line: usize) -> Self {
        self.cascade = Some(line);
        self
    }

    /// Set the priority mode
    pub fn with_priority(mut self, priority: PriorityMode) -> Self {
        self.priority = priority;
        self
    }
}

/// Raw register view of one bank, bit n = line offset n
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankRegisters {
    /// Interrupt request register
    pub irr: u32,
    /// Interrupt mask register
    pub imr: u32,
    /// In-service register
    pub isr: u32,
}

/// Serializable line state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub flags: LineFlags,
    pub trigger: TriggerMode,
}

/// Serializable bank modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankModes {
    pub priority: PriorityMode,
    pub auto_eoi: bool,
}

/// Serializable contents of an [`InterruptController`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptState {
    pub lines: Vec<LineRecord>,
    pub banks: Vec<BankModes>,
}

#[derive(Debug, Clone)]
struct Bank {
    first: usize,
    len: usize,
    vector_base: u8,
    cascade: Option<usize>,
    priority: PriorityMode,
    auto_eoi: bool,
}

#[derive(Debug, Clone, Copy)]
struct IrqLine {
    flags: LineFlags,
    trigger: TriggerMode,
    bank: usize,
    /// Secondary bank resolved through this line
    child: Option<usize>,
}

/// Priority interrupt controller
///
/// # Example
///
/// ```
/// use emutick::core::interrupt::InterruptController;
///
/// let mut pic = InterruptController::pc_xt();
/// pic.set_irq_mask(4, false);
/// pic.activate_irq(4);
///
/// assert!(pic.run_queue());
/// let delivery = pic.last_delivery().unwrap();
/// assert_eq!((delivery.line, delivery.vector), (4, 0x0C));
///
/// pic.end_of_interrupt(4);
/// assert!(!pic.run_queue());
/// ```
#[derive(Debug, Clone)]
pub struct InterruptController {
    lines: Vec<IrqLine>,
    banks: Vec<Bank>,
    /// (requested line, routed line)
    redirects: Vec<(usize, usize)>,
    last_delivery: Option<Delivery>,
}

impl InterruptController {
    /// Build a controller from bank descriptions
    ///
    /// Banks are numbered in declaration order; their lines are numbered
    /// consecutively. Every line starts masked. A cascaded bank must name a
    /// line of an earlier bank, and each line carries at most one bank.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for an invalid topology.
    pub fn new(banks: &[BankConfig]) -> Result<Self> {
        if banks.is_empty() {
            return Err(CoreError::Config("interrupt controller needs a bank".into()));
        }

        let mut first = 0;
        for (i, bank) in banks.iter().enumerate() {
            if bank.lines == 0 || bank.lines > MAX_BANK_LINES {
                return Err(CoreError::Config(format!(
                    "bank {} has {} lines (1..={} allowed)",
                    i, bank.lines, MAX_BANK_LINES
                )));
            }
            match (i, bank.cascade) {
                (0, Some(_)) => {
                    return Err(CoreError::Config("the primary bank cannot be cascaded".into()))
                }
                (_, Some(line)) if line >= first => {
                    return Err(CoreError::Config(format!(
                        "bank {} cascades into line {} which is not in an earlier bank",
                        i, line
                    )))
                }
                (0, None) => {}
                (_, None) => {
                    return Err(CoreError::Config(format!(
                        "bank {} is not cascaded into any line",
                        i
                    )))
                }
                _ => {}
            }
            let shared = banks[..i]
                .iter()
                .any(|other| other.cascade.is_some() && other.cascade == bank.cascade);
            if shared {
                return Err(CoreError::Config(format!(
                    "bank {} shares its cascade line with another bank",
                    i
                )));
            }
            first += bank.lines;
        }

        Ok(Self::build(banks))
    }

    fn build(configs: &[BankConfig]) -> Self {
        let mut banks = Vec::with_capacity(configs.len());
        let mut lines = Vec::new();

        for (index, config) in configs.iter().enumerate() {
            banks.push(Bank {
                first: lines.len(),
                len: config.lines,
                vector_base: config.vector_base,
                cascade: config.cascade,
                priority: config.priority,
                auto_eoi: config.auto_eoi,
            });
            lines.extend((0..config.lines).map(|_| IrqLine {
                flags: LineFlags::MASKED,
                trigger: TriggerMode::Edge,
                bank: index,
                child: None,
            }));
        }

        for (index, bank) in banks.iter().enumerate() {
            if let Some(parent_line) = bank.cascade {
                lines[parent_line].child = Some(index);
            }
        }

        Self {
            lines,
            banks,
            redirects: Vec::new(),
            last_delivery: None,
        }
    }

    /// Two cascaded 8-line banks, as on the PC/AT
    ///
    /// Vectors 0x08 and 0x70, fully nested priority, line 2 requests
    /// redirected to line 9, lines 0, 1, 2 and 8 unmasked.
    pub fn pc_at() -> Self {
        let mut pic = Self::build(&[
            BankConfig::new(8, 0x08).with_priority(PriorityMode::FullyNested),
            BankConfig::new(8, 0x70)
                .cascaded_into(2)
                .with_priority(PriorityMode::FullyNested),
        ]);
        pic.redirects.push((2, 9));
        for line in [0, 1, 2, 8] {
            pic.set_irq_mask(line, false);
        }
        pic
    }

    /// A single 8-line bank, as on the PC/XT
    ///
    /// Vector 0x08, fully nested priority, line 9 requests redirected to
    /// line 2, lines 0 and 1 unmasked.
    pub fn pc_xt() -> Self {
        let mut pic =
            Self::build(&[BankConfig::new(8, 0x08).with_priority(PriorityMode::FullyNested)]);
        pic.redirects.push((9, 2));
        for line in [0, 1] {
            pic.set_irq_mask(line, false);
        }
        pic
    }

    /// Build the legacy layout described by the configuration
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if an unmasked line does not exist.
    pub fn from_config(config: &PicConfig) -> Result<Self> {
        let primary = BankConfig {
            lines: 8,
            vector_base: config.primary_vector_base,
            cascade: None,
            priority: config.priority,
            auto_eoi: config.auto_eoi,
        };

        let mut pic = if config.secondary {
            let secondary = BankConfig {
                lines: 8,
                vector_base: config.secondary_vector_base,
                cascade: Some(2),
                priority: config.priority,
                auto_eoi: config.auto_eoi,
            };
            let mut pic = Self::new(&[primary, secondary])?;
            pic.redirects.push((2, 9));
            pic
        } else {
            let mut pic = Self::new(&[primary])?;
            pic.redirects.push((9, 2));
            pic
        };

        for &line in &config.unmasked {
            if line >= pic.lines.len() {
                return Err(CoreError::Config(format!(
                    "unmasked line {} does not exist ({} lines)",
                    line,
                    pic.lines.len()
                )));
            }
            pic.set_irq_mask(line, false);
        }

        log::info!(
            "PIC: {} banks, {} lines, priority={:?}",
            pic.banks.len(),
            pic.lines.len(),
            config.priority
        );
        Ok(pic)
    }

    /// Apply redirects and validate a line number for request handling
    fn route(&self, line: usize, action: &str) -> Option<usize> {
        let routed = self
            .redirects
            .iter()
            .find(|(from, _)| *from == line)
            .map_or(line, |(_, to)| *to);

        if routed >= self.lines.len() {
            log::error!(
                "PIC: attempted to {} IRQ {} which does not exist ({} lines)",
                action,
                line,
                self.lines.len()
            );
            return None;
        }
        if self.lines[routed].child.is_some() {
            log::error!(
                "PIC: attempted to {} IRQ {} which carries a cascaded bank",
                action,
                routed
            );
            return None;
        }
        Some(routed)
    }

    /// Assert a line's request
    ///
    /// A no-op if the line is already requested. The line becomes pending if
    /// it is unmasked and not in service.
    pub fn activate_irq(&mut self, line: usize) {
        let Some(line) = self.route(line, "raise") else {
            return;
        };
        let irq = &mut self.lines[line];
        if irq.flags.contains(LineFlags::REQUESTED) {
            return;
        }
        irq.flags.insert(LineFlags::REQUESTED);
        log::trace!("PIC: IRQ {} requested, flags={:?}", line, irq.flags);
    }

    /// Clear a line's request (level-triggered source deasserted)
    ///
    /// An in-service line keeps its in-service state; the handler must still
    /// issue end-of-interrupt.
    pub fn deactivate_irq(&mut self, line: usize) {
        let Some(line) = self.route(line, "lower") else {
            return;
        };
        let irq = &mut self.lines[line];
        if irq.flags.contains(LineFlags::REQUESTED) {
            irq.flags.remove(LineFlags::REQUESTED);
            log::trace!("PIC: IRQ {} lowered, flags={:?}", line, irq.flags);
        }
    }

    /// Mask or unmask a line
    ///
    /// Masking a cascade line masks its whole secondary bank.
    pub fn set_irq_mask(&mut self, line: usize, masked: bool) {
        let Some(irq) = self.lines.get_mut(line) else {
            log::error!("PIC: attempted to mask IRQ {} which does not exist", line);
            return;
        };
        irq.flags.set(LineFlags::MASKED, masked);
        log::debug!(
            "PIC: IRQ {} {}",
            line,
            if masked { "masked" } else { "unmasked" }
        );
    }

    /// Number of eligible line offsets at the top of a bank's priority order
    fn scan_limit(&self, bank: &Bank) -> usize {
        let lines = &self.lines[bank.first..bank.first + bank.len];
        let in_service = lines
            .iter()
            .position(|l| l.flags.contains(LineFlags::IN_SERVICE));

        match (bank.priority, in_service) {
            (_, None) | (PriorityMode::SpecialMask, _) => bank.len,
            (PriorityMode::Exclusive, Some(_)) => 0,
            (PriorityMode::FullyNested, Some(offset)) => offset,
        }
    }

    /// Highest-priority eligible line of a bank, descending into cascades
    fn resolve(&self, bank_index: usize) -> Option<usize> {
        let bank = &self.banks[bank_index];
        let limit = self.scan_limit(bank);

        for line in bank.first..bank.first + limit {
            let irq = &self.lines[line];
            if irq
                .flags
                .intersects(LineFlags::MASKED | LineFlags::IN_SERVICE)
            {
                continue;
            }
            match irq.child {
                Some(child) => {
                    if let Some(found) = self.resolve(child) {
                        return Some(found);
                    }
                }
                None if irq.flags.contains(LineFlags::REQUESTED) => return Some(line),
                None => {}
            }
        }
        None
    }

    /// Acknowledge `line` and every cascade line it was delivered through
    fn start(&mut self, line: usize) {
        let bank = &self.banks[self.lines[line].bank];
        let auto_eoi = bank.auto_eoi;
        let parent = bank.cascade;

        let irq = &mut self.lines[line];
        if irq.trigger == TriggerMode::Edge {
            irq.flags.remove(LineFlags::REQUESTED);
        }
        if !auto_eoi {
            irq.flags.insert(LineFlags::IN_SERVICE);
        }

        if let Some(parent_line) = parent {
            self.start(parent_line);
        }
    }

    /// True if `run_queue` would deliver an interrupt
    pub fn has_pending(&self) -> bool {
        self.resolve(0).is_some()
    }

    /// Select and acknowledge the highest-priority eligible line
    ///
    /// Marks the line in service (unless its bank uses auto-EOI) and returns
    /// its delivery, or `None` if nothing is eligible.
    pub fn next_interrupt(&mut self) -> Option<Delivery> {
        let line = self.resolve(0)?;
        self.start(line);

        let bank = &self.banks[self.lines[line].bank];
        let vector = bank.vector_base.wrapping_add((line - bank.first) as u8);
        log::trace!("PIC: delivering IRQ {} (vector 0x{:02X})", line, vector);
        Some(Delivery { line, vector })
    }

    /// Select and acknowledge the next interrupt for the CPU
    ///
    /// Returns true if an interrupt was delivered; the delivery is then
    /// available from [`InterruptController::last_delivery`].
    pub fn run_queue(&mut self) -> bool {
        self.last_delivery = self.next_interrupt();
        self.last_delivery.is_some()
    }

    /// Delivery selected by the last `run_queue` call
    pub fn last_delivery(&self) -> Option<Delivery> {
        self.last_delivery
    }

    /// End the in-service state of `line`
    ///
    /// For a line of a cascaded bank, the cascade line in the parent bank is
    /// released too once no line of the secondary bank remains in service.
    pub fn end_of_interrupt(&mut self, line: usize) {
        let Some(irq) = self.lines.get_mut(line) else {
            log::error!("PIC: EOI for IRQ {} which does not exist", line);
            return;
        };
        if !irq.flags.contains(LineFlags::IN_SERVICE) {
            log::trace!("PIC: EOI for IRQ {} which is not in service", line);
            return;
        }
        irq.flags.remove(LineFlags::IN_SERVICE);
        log::trace!("PIC: EOI IRQ {}", line);

        let bank = &self.banks[irq.bank];
        if let Some(parent_line) = bank.cascade {
            let busy = self.lines[bank.first..bank.first + bank.len]
                .iter()
                .any(|l| l.flags.contains(LineFlags::IN_SERVICE));
            if !busy {
                self.end_of_interrupt(parent_line);
            }
        }
    }

    /// End the highest-priority in-service line of a bank
    ///
    /// Ignored when nothing in the bank is in service; software commonly
    /// sends EOIs to both banks regardless of the source.
    ///
    /// # Returns
    ///
    /// The line whose in-service state was cleared
    pub fn end_of_interrupt_nonspecific(&mut self, bank: usize) -> Option<usize> {
        let bank = self.banks.get(bank)?;
        let line = (bank.first..bank.first + bank.len)
            .find(|&l| self.lines[l].flags.contains(LineFlags::IN_SERVICE))?;
        self.lines[line].flags.remove(LineFlags::IN_SERVICE);
        log::trace!("PIC: non-specific EOI cleared IRQ {}", line);
        Some(line)
    }

    /// Observable state of a line
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidLine`] for lines outside the topology.
    pub fn line_state(&self, line: usize) -> Result<LineState> {
        let irq = self
            .lines
            .get(line)
            .ok_or(CoreError::InvalidLine { line })?;
        let flags = irq.flags;
        Ok(if flags.contains(LineFlags::IN_SERVICE) {
            LineState::InService
        } else if !flags.contains(LineFlags::REQUESTED) {
            LineState::Idle
        } else if flags.contains(LineFlags::MASKED) {
            LineState::Masked
        } else {
            LineState::Pending
        })
    }

    /// Raw flags of a line
    pub fn line_flags(&self, line: usize) -> Option<LineFlags> {
        self.lines.get(line).map(|l| l.flags)
    }

    /// Set how a line's request latch is released
    pub fn set_trigger_mode(&mut self, line: usize, trigger: TriggerMode) -> Result<()> {
        let irq = self
            .lines
            .get_mut(line)
            .ok_or(CoreError::InvalidLine { line })?;
        irq.trigger = trigger;
        log::debug!("PIC: IRQ {} trigger mode {:?}", line, trigger);
        Ok(())
    }

    /// Set the priority mode of a bank
    pub fn set_priority_mode(&mut self, bank: usize, priority: PriorityMode) -> Result<()> {
        let entry = self
            .banks
            .get_mut(bank)
            .ok_or_else(|| CoreError::Config(format!("bank {} does not exist", bank)))?;
        entry.priority = priority;
        log::debug!("PIC: bank {} priority mode {:?}", bank, priority);
        Ok(())
    }

    /// Enable or disable auto-EOI on a bank
    pub fn set_auto_eoi(&mut self, bank: usize, auto_eoi: bool) -> Result<()> {
        let entry = self
            .banks
            .get_mut(bank)
            .ok_or_else(|| CoreError::Config(format!("bank {} does not exist", bank)))?;
        entry.auto_eoi = auto_eoi;
        log::debug!("PIC: bank {} auto-EOI {}", bank, auto_eoi);
        Ok(())
    }

    /// Register view of a bank
    pub fn bank_registers(&self, bank: usize) -> Option<BankRegisters> {
        let bank = self.banks.get(bank)?;
        let mut regs = BankRegisters::default();
        for offset in 0..bank.len {
            let flags = self.lines[bank.first + offset].flags;
            let bit = 1u32 << offset;
            if flags.contains(LineFlags::REQUESTED) {
                regs.irr |= bit;
            }
            if flags.contains(LineFlags::MASKED) {
                regs.imr |= bit;
            }
            if flags.contains(LineFlags::IN_SERVICE) {
                regs.isr |= bit;
            }
        }
        Some(regs)
    }

    /// Total number of lines
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Number of banks
    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Capture line and bank state for a save state
    pub fn state(&self) -> InterruptState {
        InterruptState {
            lines: self
                .lines
                .iter()
                .map(|l| LineRecord {
                    flags: l.flags,
                    trigger: l.trigger,
                })
                .collect(),
            banks: self
                .banks
                .iter()
                .map(|b| BankModes {
                    priority: b.priority,
                    auto_eoi: b.auto_eoi,
                })
                .collect(),
        }
    }

    /// Restore state captured by [`InterruptController::state`]
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Snapshot`] if the state was taken from a
    /// controller with a different number of lines or banks.
    pub fn restore(&mut self, state: &InterruptState) -> Result<()> {
        if state.lines.len() != self.lines.len() || state.banks.len() != self.banks.len() {
            return Err(CoreError::Snapshot(format!(
                "interrupt topology mismatch: snapshot has {} lines/{} banks, controller has {}/{}",
                state.lines.len(),
                state.banks.len(),
                self.lines.len(),
                self.banks.len()
            )));
        }

        for (line, record) in self.lines.iter_mut().zip(&state.lines) {
            line.flags = record.flags;
            line.trigger = record.trigger;
        }
        for (bank, modes) in self.banks.iter_mut().zip(&state.banks) {
            bank.priority = modes.priority;
            bank.auto_eoi = modes.auto_eoi;
        }
        self.last_delivery = None;
        Ok(())
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::pc_at()
    }
}
