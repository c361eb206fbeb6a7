//! Scenarios run against a freshly booted simulated system.
//!
//! The system is built with an abort handler that records the reason instead
//! of terminating the process, so watchdog expiries can be reported.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use log::{info, warn};
use parking_lot::Mutex;
use smp_ipc::{Ipc, IpcConfig, IpcError};
use smp_rtos::port;
use smp_rtos::{CoreId, InterruptSource, SpawnedTask, System, SystemConfig, TaskConfig};
use smp_wdt::{IntWdt, IntWdtConfig, SimMwdt, Stage, TaskWatchdog, TimerGroup};

use crate::{IntWdtArgs, IpcArgs, StallArgs, TaskWdtArgs};

/// Source used to keep a core's dispatcher busy; no timer group owns it.
const BUSY_SOURCE: InterruptSource = InterruptSource::Watchdog(5);

type AbortLog = Arc<Mutex<Vec<String>>>;

fn boot(cores: usize) -> Result<(Arc<System>, AbortLog)> {
    let aborts: AbortLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&aborts);
    let config = SystemConfig::builder()
        .num_cores(cores)
        .abort_handler(move |reason| {
            warn!(target: "smpctl", "abort requested: {reason}");
            sink.lock().push(reason.to_owned());
        })
        .build();
    let system = System::new(config).context("creating system")?;
    system.start().context("starting scheduler")?;
    info!(target: "smpctl", "booted {cores} core(s)");
    Ok((system, aborts))
}

fn join(task: SpawnedTask) -> Result<()> {
    let name = task.handle().name().to_owned();
    task.join().map_err(|_| anyhow!("task {name} panicked"))
}

fn report_aborts(aborts: &AbortLog) {
    let aborts = aborts.lock();
    if aborts.is_empty() {
        println!("{}", "no abort requested".bright_green());
        return;
    }
    println!("{}", format!("{} abort request(s):", aborts.len()).bright_red().bold());
    for reason in aborts.iter() {
        println!("  {reason}");
    }
}

pub fn ipc(args: &IpcArgs) -> Result<()> {
    let (system, aborts) = boot(args.cores)?;
    let config = IpcConfig::builder()
        .priority_policy(args.policy.into())
        .wake(args.wake.into())
        .build();
    let ipc = Ipc::init(Arc::clone(&system), config).context("starting IPC workers")?;

    for index in 0..args.cores {
        let core = CoreId(index as u8);

        let ran_on = Arc::new(AtomicU8::new(u8::MAX));
        let seen = Arc::clone(&ran_on);
        ipc.call_blocking(core, move || seen.store(port::current_core().0, Ordering::SeqCst))?;
        info!(
            target: "smpctl",
            "call_blocking to {core} ran on CPU {}",
            ran_on.load(Ordering::SeqCst)
        );

        for _ in 0..args.calls {
            ipc.call(core, || {})?;
        }

        let mut busy = 0u32;
        loop {
            match ipc.call_nonblocking(core, || {}) {
                Ok(()) => break,
                Err(IpcError::Busy) => {
                    busy += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(err.into()),
            }
        }
        if busy > 0 {
            info!(target: "smpctl", "non-blocking call to {core} was busy {busy} time(s)");
        }
    }

    // Let the last non-blocking calls drain.
    thread::sleep(Duration::from_millis(20));

    println!("{}", "served calls per core".bold());
    for index in 0..args.cores {
        let core = CoreId(index as u8);
        let priority = ipc.worker_task(core).map_or(0, |task| task.priority());
        println!("  {core}: {:>5}  (worker priority {priority})", ipc.served(core));
    }
    drop(ipc);
    report_aborts(&aborts);
    Ok(())
}

pub fn stall(args: &StallArgs) -> Result<()> {
    let (system, aborts) = boot(2)?;
    let ipc = Ipc::init(Arc::clone(&system), IpcConfig::default())?;
    let isr = ipc
        .isr()
        .cloned()
        .ok_or_else(|| anyhow!("ISR-level IPC is not available on this system"))?;

    let hold = Duration::from_millis(args.hold_ms);
    let depth = args.depth.max(1);
    let ticks_stalled = Arc::new(AtomicU64::new(0));
    let ticks_released = Arc::new(AtomicU64::new(0));

    let body = {
        let system = Arc::clone(&system);
        let isr = Arc::clone(&isr);
        let stalled = Arc::clone(&ticks_stalled);
        let released = Arc::clone(&ticks_released);
        move || {
            let start = system.tick_count(CoreId(0));
            for _ in 0..depth {
                isr.stall_other_core();
            }
            info!(target: "smpctl", "CPU 0 stalled, depth {}", isr.stall_depth());
            thread::sleep(hold);
            let mid = system.tick_count(CoreId(0));
            for _ in 0..depth {
                isr.release_other_core();
            }
            thread::sleep(hold);
            stalled.store(mid - start, Ordering::SeqCst);
            released.store(system.tick_count(CoreId(0)) - mid, Ordering::SeqCst);
        }
    };
    let staller = system.spawn(
        TaskConfig::new("staller").pinned_to(CoreId(1)).with_priority(5),
        body,
    )?;
    join(staller)?;

    let stats = isr.stats();
    println!("{}", "stall of CPU 0 from CPU 1".bold());
    println!("  ticks on CPU 0 while stalled:  {}", ticks_stalled.load(Ordering::SeqCst));
    println!("  ticks on CPU 0 after release:  {}", ticks_released.load(Ordering::SeqCst));
    println!(
        "  cross-core calls {}, finish commands {}",
        stats.cross_core_calls, stats.finish_commands
    );
    drop(ipc);
    report_aborts(&aborts);
    Ok(())
}

pub fn task_wdt(args: &TaskWdtArgs) -> Result<()> {
    let (system, aborts) = boot(2)?;
    let mwdt = SimMwdt::new(&system, TimerGroup::Timg0)?;
    let monitor = mwdt.monitor();
    let wdt = Arc::new(TaskWatchdog::new(Arc::clone(&system), Box::new(mwdt)));
    wdt.init(Duration::from_millis(args.timeout_ms), args.panic)?;
    wdt.set_timeout_handler(|report| {
        info!(
            target: "smpctl",
            "timeout on {}: {}",
            report.core,
            report.names().join(", ")
        );
    });
    if args.idle {
        for index in 0..system.num_cores() {
            if let Some(idle) = system.idle_task(CoreId(index as u8)) {
                wdt.add(Some(&idle))?;
            }
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let mut tasks = Vec::with_capacity(args.tasks.len());
    for spec in &args.tasks {
        let wdt = Arc::clone(&wdt);
        let running = Arc::clone(&running);
        let period = spec.period;
        tasks.push(system.spawn(TaskConfig::new(spec.name.as_str()), move || {
            if let Err(err) = wdt.add(None) {
                warn!(target: "smpctl", "subscribe failed: {err}");
                return;
            }
            while running.load(Ordering::Acquire) {
                thread::sleep(period);
                let _ = wdt.reset();
            }
            let _ = wdt.delete(None);
        })?);
    }

    thread::sleep(Duration::from_millis(args.run_ms));
    running.store(false, Ordering::Release);
    for task in tasks {
        join(task)?;
    }

    println!("{}", "task watchdog".bold());
    println!("  timeouts:    {}", wdt.timeouts());
    println!("  feeds:       {}", monitor.feeds());
    println!("  stage 1 hit: {}", monitor.expirations(Stage::Stage1));
    wdt.deinit()?;
    report_aborts(&aborts);
    Ok(())
}

pub fn int_wdt(args: &IntWdtArgs) -> Result<()> {
    let (system, aborts) = boot(args.cores)?;
    let mwdt = SimMwdt::new(&system, TimerGroup::Timg1)?;
    let monitor = mwdt.monitor();
    let config = IntWdtConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        check_all_cores: !args.core0_only,
    };
    let wdt = IntWdt::init(Arc::clone(&system), Box::new(mwdt), config)?;

    let mut busy = None;
    if let Some(core) = args.stall_core {
        let core = CoreId(core);
        system.check_core(core)?;
        let stall = Duration::from_millis(args.stall_ms);
        // Give the first feed a chance to replace the initial timeout.
        thread::sleep(system.tick_period() * 4);
        busy = Some(system.interrupts().allocate(
            core,
            BUSY_SOURCE,
            5,
            Arc::new(move || thread::sleep(stall)),
        )?);
        system.interrupts().raise(BUSY_SOURCE)?;
        info!(target: "smpctl", "{core} busy in an interrupt for {stall:?}");
    }

    thread::sleep(Duration::from_millis(args.run_ms));

    println!("{}", "interrupt watchdog".bold());
    println!("  feeds:          {}", wdt.feeds());
    println!("  stage 0 expiry: {}", monitor.expirations(Stage::Stage0));
    drop(wdt);
    if let Some(handle) = busy {
        system.interrupts().free(handle)?;
    }
    report_aborts(&aborts);
    Ok(())
}
