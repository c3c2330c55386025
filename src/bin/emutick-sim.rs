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

//! emutick simulation harness
//!
//! Drives a scripted PC-like machine on top of the timing core: a programmable
//! interval timer on IRQ 0, a real-time clock on IRQ 8 and a keyboard that
//! produces a burst of scancodes on IRQ 1 every 50 ms. The CPU is modelled as
//! a loop that executes blocks sized by the driver and takes every interrupt
//! it is offered. A JSON summary is printed at the end.

use clap::Parser;
use emutick::core::config::Config;
use emutick::core::snapshot::CoreSnapshot;
use emutick::core::system::TickDriver;
use emutick::core::timing::Consumption;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// PIT input clock in Hz
const PIT_CLOCK_HZ: f64 = 1_193_182.0;

/// Run the timing core against a scripted set of devices
#[derive(Parser)]
#[command(name = "emutick-sim", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emulated milliseconds to run
    #[arg(short, long, default_value_t = 100)]
    ms: u32,

    /// Fixed CPU block size in cycles, at least 1 (default: sized by the driver)
    #[arg(short, long, value_parser = clap::value_parser!(i32).range(1..))]
    block: Option<i32>,

    /// PIT channel 0 reload value
    #[arg(long, default_value_t = 0x10000)]
    pit_reload: u32,

    /// RTC periodic interrupt rate in Hz
    #[arg(long, default_value_t = 1024.0)]
    rtc_hz: f64,

    /// Restore a snapshot before running
    #[arg(long, value_name = "PATH")]
    load: Option<PathBuf>,

    /// Write a snapshot after running
    #[arg(long, value_name = "PATH")]
    save: Option<PathBuf>,

    /// Write the default configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    dump_config: Option<PathBuf>,
}

#[derive(Serialize)]
struct Summary {
    elapsed_ticks: u32,
    now_ms: f64,
    blocks: u64,
    events_dispatched: u64,
    clamped_blocks: u64,
    interrupts: BTreeMap<usize, u64>,
    pending_events: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Some(path) = &cli.dump_config {
        Config::default().save(path)?;
        log::info!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut driver = TickDriver::new(&config)?;

    // Devices register in a fixed order so snapshot handler identities match
    let pit_period = cli.pit_reload.max(1) as f64 * 1000.0 / PIT_CLOCK_HZ;
    let pit = driver.register_handler("pit", move |ctx, _| {
        ctx.activate_irq(0);
        if let Some(me) = ctx.handler() {
            if let Err(e) = ctx.schedule(me, pit_period, 0) {
                log::error!("PIT: failed to reschedule: {}", e);
            }
        }
    });

    let rtc_period = 1000.0 / cli.rtc_hz.max(1.0);
    let rtc = driver.register_handler("rtc", move |ctx, _| {
        ctx.activate_irq(8);
        if let Some(me) = ctx.handler() {
            if let Err(e) = ctx.schedule(me, rtc_period, 0) {
                log::error!("RTC: failed to reschedule: {}", e);
            }
        }
    });

    let keyboard = driver.register_handler("keyboard", |ctx, scancode| {
        log::debug!("Keyboard: scancode 0x{:02X}", scancode);
        ctx.activate_irq(1);
    });

    let mut ms_counter = 0u32;
    driver.add_tick_handler("keyboard-script", move |ctx| {
        ms_counter += 1;
        if ms_counter % 50 == 0 {
            // Make and break codes of 'A', 2 ms apart
            for (i, scancode) in [0x1Eu32, 0x9E].into_iter().enumerate() {
                if let Err(e) = ctx.schedule(keyboard, i as f64 * 2.0, scancode) {
                    log::error!("Keyboard: failed to queue scancode: {}", e);
                }
            }
        }
    });

    match &cli.load {
        Some(path) => driver.restore(&CoreSnapshot::load(path)?)?,
        None => {
            driver.schedule(pit, pit_period, 0)?;
            driver.schedule(rtc, rtc_period, 0)?;
        }
    }

    log::info!(
        "Running {} ms (PIT period {:.4} ms, RTC period {:.4} ms)",
        cli.ms,
        pit_period,
        rtc_period
    );

    let mut summary = Summary {
        elapsed_ticks: 0,
        now_ms: 0.0,
        blocks: 0,
        events_dispatched: 0,
        clamped_blocks: 0,
        interrupts: BTreeMap::new(),
        pending_events: 0,
    };

    let mut ticks = 0;
    while ticks < cli.ms {
        let cycles = cli.block.unwrap_or_else(|| driver.next_block_cycles());
        let outcome = driver.step(cycles);

        summary.blocks += 1;
        summary.events_dispatched += outcome.dispatched as u64;
        if matches!(outcome.consumption, Consumption::Clamped { .. }) {
            summary.clamped_blocks += 1;
        }
        if outcome.tick_completed {
            ticks += 1;
        }

        // Interrupt handlers are instantaneous: acknowledge and EOI at once
        if let Some(delivery) = outcome.interrupt {
            *summary.interrupts.entry(delivery.line).or_default() += 1;
            driver.end_of_interrupt(delivery.line);
            while driver.run_queue() {
                if let Some(next) = driver.last_delivery() {
                    *summary.interrupts.entry(next.line).or_default() += 1;
                    driver.end_of_interrupt(next.line);
                }
            }
        }
    }

    summary.elapsed_ticks = driver.clock().elapsed_ticks();
    summary.now_ms = driver.now();
    summary.pending_events = driver.events().len();

    if let Some(path) = &cli.save {
        driver.snapshot().save(path)?;
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
