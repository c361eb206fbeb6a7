//! Integration tests for the running system: tasks, interrupts and ticks together.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smp_rtos::port;
use smp_rtos::{CoreId, InterruptSource, NotifyAction, Semaphore, System, SystemConfig, TaskConfig};

#[test]
fn pinned_task_observes_its_core() {
    let system = System::start_default().unwrap();
    let seen = Arc::new(AtomicU8::new(u8::MAX));
    let record = Arc::clone(&seen);

    let task = system
        .spawn(TaskConfig::new("pinned").pinned_to(CoreId(1)), move || {
            record.store(port::current_core().0, Ordering::SeqCst);
        })
        .unwrap();
    task.join().unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn isr_give_wakes_blocked_task() {
    let system = System::start_default().unwrap();
    let sem = Arc::new(Semaphore::binary());

    let waiter_sem = Arc::clone(&sem);
    let waiter = system
        .spawn(TaskConfig::new("waiter"), move || {
            waiter_sem.take(Some(Duration::from_secs(2))).unwrap();
        })
        .unwrap();

    let isr_sem = Arc::clone(&sem);
    let handle = system
        .interrupts()
        .allocate(
            CoreId(0),
            InterruptSource::Watchdog(3),
            2,
            Arc::new(move || {
                assert!(port::in_isr_context());
                let _ = isr_sem.give_from_isr();
            }),
        )
        .unwrap();
    system
        .interrupts()
        .raise(InterruptSource::Watchdog(3))
        .unwrap();

    waiter.join().unwrap();
    assert_eq!(
        system.interrupts().delivered_count(InterruptSource::Watchdog(3)),
        1
    );
    system.interrupts().free(handle).unwrap();
}

#[test]
fn isr_notification_reaches_task() {
    let system = System::start_default().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();

    let waiter = system
        .spawn(TaskConfig::new("notified").pinned_to(CoreId(1)), move || {
            let value = smp_rtos::task::current()
                .notification()
                .wait(u32::MAX, Some(Duration::from_secs(2)));
            tx.send(value).unwrap();
        })
        .unwrap();
    let target = waiter.handle().clone();

    let handle = system
        .interrupts()
        .allocate(
            CoreId(0),
            InterruptSource::Watchdog(4),
            2,
            Arc::new(move || target.notify(0b101, NotifyAction::SetBits)),
        )
        .unwrap();
    system
        .interrupts()
        .raise(InterruptSource::Watchdog(4))
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), Some(0b101));
    waiter.join().unwrap();
    system.interrupts().free(handle).unwrap();
}

#[test]
fn busy_handler_freezes_only_its_core_tick() {
    let system = System::new(SystemConfig::builder().tick_rate_hz(1000).build()).unwrap();
    system.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    let handle = system
        .interrupts()
        .allocate(
            CoreId(1),
            InterruptSource::Watchdog(6),
            5,
            Arc::new(|| thread::sleep(Duration::from_millis(100))),
        )
        .unwrap();
    system
        .interrupts()
        .raise(InterruptSource::Watchdog(6))
        .unwrap();
    thread::sleep(Duration::from_millis(10));

    let core0 = system.tick_count(CoreId(0));
    let core1 = system.tick_count(CoreId(1));
    thread::sleep(Duration::from_millis(50));

    assert!(system.tick_count(CoreId(0)) >= core0 + 20);
    assert!(system.tick_count(CoreId(1)) <= core1 + 1);
    system.interrupts().free(handle).unwrap();
}

#[test]
fn shutdown_stops_ticks() {
    let system = System::start_default().unwrap();
    thread::sleep(Duration::from_millis(30));
    system.shutdown();
    assert!(!system.is_scheduler_running());

    let frozen = system.tick_count(CoreId(0));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(system.tick_count(CoreId(0)), frozen);
}
