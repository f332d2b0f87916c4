//! CARVE firmware binary.
//!
//! Wires the serial transport, the non-volatile image, and the step tick
//! thread around the protocol loop. With the `rt` feature the tick
//! thread is memory-locked, core-pinned, and scheduled SCHED_FIFO; the
//! default build paces with plain sleeps for simulation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use carve_common::consts::STEP_TIMER_FREQUENCY_HZ;
use carve_common::nvs::FileStore;
use carve_common::state::RtFlags;
use carve_core::config::{BootConfig, RtConfig};
use carve_core::machine::{Machine, StepDriver};
use carve_core::serial::StdioTransport;
use carve_motion::stepper::StepperShared;

#[derive(Parser, Debug)]
#[command(name = "carve", about = "CNC motion-control firmware (hosted)")]
struct Cli {
    /// Boot configuration TOML.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the non-volatile image path.
    #[arg(long)]
    nvs: Option<PathBuf>,

    /// Keep the step interrupt inline instead of spawning a tick thread.
    #[arg(long)]
    inline_stepper: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BootConfig::load(path)?,
        None => BootConfig::default(),
    };
    if let Some(nvs) = cli.nvs {
        config.nvs_path = nvs;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(nvs = %config.nvs_path.display(), "carve starting");

    let rt_flags = Arc::new(RtFlags::new());
    let nvs = Box::new(FileStore::open(&config.nvs_path)?);
    let transport = Box::new(StdioTransport::spawn(Arc::clone(&rt_flags)));
    let mut machine = Machine::new(nvs, transport, rt_flags);

    if !cli.inline_stepper {
        let driver = machine.take_driver().expect("driver present at boot");
        let shared = Arc::clone(&machine.shared);
        let rt_config = config.rt.clone();
        std::thread::Builder::new()
            .name("step-tick".into())
            .spawn(move || stepper_thread(driver, shared, rt_config))?;
    }

    machine.run();
    Ok(())
}

/// Dedicated step tick thread: the hosted stand-in for the step timer
/// interrupt. Paces each tick by the active segment's timer reload.
fn stepper_thread(mut driver: StepDriver, _shared: Arc<StepperShared>, rt_config: RtConfig) {
    if let Err(e) = rt_setup(&rt_config) {
        error!("rt setup failed: {e}; continuing without rt scheduling");
    }

    loop {
        driver.isr.tick(&mut driver.pins);
        // Segment reload is in step-timer cycles; at 1 MHz that is µs.
        let sleep_us = driver
            .isr
            .cycles_per_tick()
            .map(|cycles| (cycles as u64 * 1_000_000) / STEP_TIMER_FREQUENCY_HZ as u64)
            .unwrap_or(1_000);
        std::thread::sleep(Duration::from_micros(sleep_us.max(1)));
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Lock pages, pin the core, go SCHED_FIFO. No-ops without the `rt`
/// feature.
#[cfg(feature = "rt")]
fn rt_setup(config: &RtConfig) -> Result<(), String> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::sys::mman::{mlockall, MlockallFlags};
    use nix::unistd::Pid;

    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| format!("mlockall failed: {e}"))?;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(config.cpu_core)
        .map_err(|e| format!("CpuSet::set({}) failed: {e}", config.cpu_core))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| format!("sched_setaffinity failed: {e}"))?;

    let param = libc::sched_param {
        sched_priority: config.rt_priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(format!(
            "sched_setscheduler(SCHED_FIFO, {}) failed: {err}",
            config.rt_priority
        ));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_setup(_config: &RtConfig) -> Result<(), String> {
    Ok(()) // Simulation mode: plain scheduling.
}
