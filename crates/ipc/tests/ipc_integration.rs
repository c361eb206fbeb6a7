//! Integration tests for cross-core calls on a started dual-core system.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use smp_ipc::{Ipc, IpcConfig, IpcError, PriorityPolicy};
use smp_rtos::{port, task, CoreId, InterruptSource, System, TaskConfig, MAX_PRIORITIES};

fn dual_core(config: IpcConfig) -> Ipc {
    let system = System::start_default().expect("start system");
    Ipc::init(system, config).expect("init ipc")
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn call_blocking_returns_after_function_finished() {
    let ipc = dual_core(IpcConfig::default());
    let counter = Arc::new(AtomicUsize::new(0));

    for round in 1..=10 {
        for index in 0..2u8 {
            let remote = Arc::clone(&counter);
            ipc.call_blocking(CoreId(index), move || {
                thread::sleep(Duration::from_millis(1));
                remote.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), round * 2 - 1 + index as usize);
        }
    }
}

#[test]
fn call_returns_while_function_still_runs() {
    let ipc = dual_core(IpcConfig::default());
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let finished = Arc::new(AtomicUsize::new(0));
    let remote = Arc::clone(&finished);

    ipc.call(CoreId(1), move || {
        let _ = release_rx.recv();
        remote.store(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 0);
    release_tx.send(()).unwrap();
    assert!(wait_for(|| finished.load(Ordering::SeqCst) == 1));
}

#[test]
fn second_nonblocking_call_reports_busy() {
    let ipc = dual_core(IpcConfig::default());
    let (release_tx, release_rx) = mpsc::channel::<()>();
    ipc.call(CoreId(1), move || {
        let _ = release_rx.recv();
    })
    .unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let first = Arc::clone(&delivered);
    ipc.call_nonblocking(CoreId(1), move || {
        first.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let second = Arc::clone(&delivered);
    assert!(matches!(
        ipc.call_nonblocking(CoreId(1), move || {
            second.fetch_add(100, Ordering::SeqCst);
        }),
        Err(IpcError::Busy)
    ));

    // A different core has its own slot.
    ipc.call_nonblocking(CoreId(0), || {}).unwrap();

    release_tx.send(()).unwrap();
    assert!(wait_for(|| delivered.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn nonblocking_from_task_boosts_worker() {
    let ipc = dual_core(IpcConfig::default());
    let (tx, rx) = mpsc::channel();
    ipc.call_nonblocking(CoreId(0), move || {
        let _ = tx.send((port::current_core(), task::current().priority()));
    })
    .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        (CoreId(0), MAX_PRIORITIES - 1)
    );

    let worker = ipc.worker_task(CoreId(0)).unwrap();
    assert!(wait_for(|| worker.priority() == worker.base_priority()));
    assert_eq!(worker.priority(), 1);
}

#[test]
fn nonblocking_slot_is_busy_until_callback_returns() {
    let ipc = dual_core(IpcConfig::default());
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    ipc.call_nonblocking(CoreId(1), move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
    })
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(matches!(
        ipc.call_nonblocking(CoreId(1), || {}),
        Err(IpcError::Busy)
    ));

    release_tx.send(()).unwrap();
    assert!(wait_for(|| ipc.call_nonblocking(CoreId(1), || {}).is_ok()));
}

#[test]
fn nonblocking_from_interrupt_context() {
    let ipc = Arc::new(dual_core(IpcConfig::default()));
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    let handler_ipc = Arc::clone(&ipc);
    let handle = ipc
        .system()
        .interrupts()
        .allocate(
            CoreId(0),
            InterruptSource::Watchdog(7),
            1,
            Arc::new(move || {
                let tx = tx.lock().clone();
                let queued = handler_ipc.call_nonblocking(CoreId(1), move || {
                    let _ = tx.send(port::in_isr_context());
                });
                assert!(queued.is_ok());
            }),
        )
        .unwrap();

    ipc.system()
        .interrupts()
        .raise(InterruptSource::Watchdog(7))
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
    assert_eq!(ipc.worker_task(CoreId(1)).unwrap().priority(), 1);

    ipc.system().interrupts().free(handle).unwrap();
}

#[test]
fn fixed_policy_serializes_all_callers() {
    let ipc = Arc::new(dual_core(
        IpcConfig::builder()
            .priority_policy(PriorityPolicy::Fixed)
            .build(),
    ));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..6u8)
        .map(|n| {
            let ipc = Arc::clone(&ipc);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            let system = Arc::clone(ipc.system());
            system
                .spawn(TaskConfig::new(format!("caller{n}")), move || {
                    for _ in 0..5 {
                        let inside = Arc::clone(&inside);
                        let overlaps = Arc::clone(&overlaps);
                        ipc.call_blocking(CoreId(n % 2), move || {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    }
                })
                .unwrap()
        })
        .collect();

    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(ipc.served(CoreId(0)) + ipc.served(CoreId(1)), 30);
}

#[cfg(feature = "isr")]
#[test]
fn stall_from_second_core_parks_first_core() {
    let ipc = Arc::new(dual_core(IpcConfig::default()));
    let isr = Arc::clone(ipc.isr().expect("dual core supports ISR IPC"));
    let depth = 4;

    let stalled = isr.clone();
    let task = ipc
        .system()
        .spawn(TaskConfig::new("staller").pinned_to(CoreId(1)), move || {
            for _ in 0..depth {
                stalled.stall_other_core();
            }
            for _ in 0..depth {
                stalled.release_other_core();
            }
        })
        .unwrap();
    task.join().unwrap();

    let interrupts = ipc.system().interrupts();
    assert_eq!(interrupts.delivered_count(InterruptSource::FromCpu(CoreId(0))), 1);
    assert_eq!(interrupts.delivered_count(InterruptSource::FromCpu(CoreId(1))), 0);
    assert_eq!(isr.stats().finish_commands, 1);
}
