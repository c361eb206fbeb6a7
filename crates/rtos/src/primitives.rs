//! Blocking synchronization primitives for tasks.
//!
//! ## Primitives
//!
//! - **Semaphore**: counting semaphore with an optional upper bound; `binary()`
//!   gives the one-slot signalling semaphore used for acknowledgements
//! - **Notification**: the per-task 32-bit notification value with the
//!   `xTaskNotify` family of update actions
//!
//! Both primitives may be given from interrupt handlers. Giving never blocks:
//! the internal lock is only held for the state update itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::task::BlockedScope;

/// Error types for synchronization primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// Semaphore count would overflow.
    #[error("semaphore count overflow")]
    Overflow,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Counting semaphore for signaling between tasks.
///
/// # Example
///
/// ```
/// use smp_rtos::Semaphore;
///
/// let sem = Semaphore::binary();
/// sem.give().unwrap();
/// assert!(sem.take(None).is_ok());
/// ```
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    count: Mutex<usize>,
    max_count: usize,
    available: Condvar,
}

impl Semaphore {
    /// Creates a new semaphore with the given initial count.
    pub fn new(initial_count: usize) -> Self {
        Self::with_max(initial_count, usize::MAX)
    }

    /// Creates a new semaphore with initial and maximum counts.
    pub fn with_max(initial_count: usize, max_count: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                count: Mutex::new(initial_count.min(max_count)),
                max_count,
                available: Condvar::new(),
            }),
        }
    }

    /// Creates a binary semaphore (max count = 1), initially empty.
    pub fn binary() -> Self {
        Self::with_max(0, 1)
    }

    /// Takes the semaphore if it is available, without blocking.
    pub fn try_take(&self) -> bool {
        let mut count = self.inner.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Takes the semaphore, blocking until available or until `timeout` elapses.
    ///
    /// `None` waits forever (`portMAX_DELAY`).
    pub fn take(&self, timeout: Option<Duration>) -> SyncResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.inner.count.lock();
        let _blocked = (*count == 0).then(BlockedScope::enter);
        while *count == 0 {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .available
                        .wait_until(&mut count, deadline)
                        .timed_out()
                        && *count == 0
                    {
                        return Err(SyncError::Timeout);
                    }
                }
                None => self.inner.available.wait(&mut count),
            }
        }
        *count -= 1;
        Ok(())
    }

    /// Gives the semaphore, waking one blocked taker.
    pub fn give(&self) -> SyncResult<()> {
        let mut count = self.inner.count.lock();
        if *count >= self.inner.max_count {
            return Err(SyncError::Overflow);
        }
        *count += 1;
        self.inner.available.notify_one();
        Ok(())
    }

    /// Gives the semaphore from an interrupt handler.
    pub fn give_from_isr(&self) -> SyncResult<()> {
        self.give()
    }

    /// Returns the current count.
    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// How a notification updates the receiving task's notification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// OR the value into the current notification value (`eSetBits`).
    SetBits,
    /// Increment the notification value, ignoring the supplied value (`eIncrement`).
    Increment,
    /// Replace the notification value (`eSetValueWithOverwrite`).
    SetValueWithOverwrite,
}

#[derive(Default)]
struct NotifyState {
    value: u32,
    pending: bool,
}

/// Direct-to-task notification slot.
#[derive(Default)]
pub struct Notification {
    state: Mutex<NotifyState>,
    signalled: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the notification value and marks it pending.
    pub fn notify(&self, value: u32, action: NotifyAction) {
        let mut state = self.state.lock();
        state.value = match action {
            NotifyAction::SetBits => state.value | value,
            NotifyAction::Increment => state.value.wrapping_add(1),
            NotifyAction::SetValueWithOverwrite => value,
        };
        state.pending = true;
        self.signalled.notify_one();
    }

    /// `xTaskNotifyGive`: increments the value, used as a light counting semaphore.
    pub fn give(&self) {
        self.notify(0, NotifyAction::Increment);
    }

    /// `vTaskNotifyGiveFromISR`.
    pub fn give_from_isr(&self) {
        self.give();
    }

    /// Blocks until a notification is pending, then returns its value and
    /// clears the bits in `clear_on_exit`.
    ///
    /// Returns `None` if `timeout` elapsed first.
    pub fn wait(&self, clear_on_exit: u32, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let _blocked = (!state.pending).then(BlockedScope::enter);
        while !state.pending {
            match deadline {
                Some(deadline) => {
                    if self
                        .signalled
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && !state.pending
                    {
                        return None;
                    }
                }
                None => self.signalled.wait(&mut state),
            }
        }
        let value = state.value;
        state.value &= !clear_on_exit;
        state.pending = false;
        Some(value)
    }

    /// `ulTaskNotifyTake`: waits for a non-zero value, then clears it to zero
    /// (`clear = true`) or decrements it.
    pub fn take(&self, clear: bool, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let _blocked = (state.value == 0).then(BlockedScope::enter);
        while state.value == 0 {
            match deadline {
                Some(deadline) => {
                    if self
                        .signalled
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.value == 0
                    {
                        return None;
                    }
                }
                None => self.signalled.wait(&mut state),
            }
        }
        let value = state.value;
        state.value = if clear { 0 } else { value - 1 };
        state.pending = state.value != 0;
        Some(value)
    }

    /// Returns the current value without consuming it.
    pub fn peek(&self) -> u32 {
        self.state.lock().value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn semaphore_give_and_take() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.count(), 0);

        sem.give().expect("give should succeed");
        assert_eq!(sem.count(), 1);

        assert!(sem.try_take());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn binary_semaphore_overflow() {
        let sem = Semaphore::binary();
        sem.give().expect("first give ok");
        assert_eq!(sem.give(), Err(SyncError::Overflow));
    }

    #[test]
    fn semaphore_take_times_out_when_empty() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_take());
        assert_eq!(
            sem.take(Some(Duration::from_millis(5))),
            Err(SyncError::Timeout)
        );
    }

    #[test]
    fn semaphore_wakes_blocked_taker() {
        let sem = Semaphore::binary();
        let giver = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            giver.give_from_isr().unwrap();
        });
        sem.take(None).expect("take should block until given");
        handle.join().unwrap();
    }

    #[test]
    fn notify_set_bits_accumulates() {
        let notification = Notification::new();
        notification.notify(0b01, NotifyAction::SetBits);
        notification.notify(0b10, NotifyAction::SetBits);
        assert_eq!(notification.wait(u32::MAX, None), Some(0b11));
        assert_eq!(notification.peek(), 0);
    }

    #[test]
    fn notify_overwrite_replaces_value() {
        let notification = Notification::new();
        notification.notify(7, NotifyAction::SetValueWithOverwrite);
        notification.notify(3, NotifyAction::SetValueWithOverwrite);
        assert_eq!(notification.wait(0, None), Some(3));
        assert_eq!(notification.peek(), 3);
    }

    #[test]
    fn notify_take_counts_gives() {
        let notification = Notification::new();
        notification.give();
        notification.give_from_isr();
        assert_eq!(notification.take(false, None), Some(2));
        assert_eq!(notification.take(true, None), Some(1));
        assert_eq!(notification.take(true, Some(Duration::from_millis(5))), None);
    }

    #[test]
    fn notify_wait_times_out() {
        let notification = Notification::new();
        assert_eq!(notification.wait(u32::MAX, Some(Duration::from_millis(5))), None);
    }
}
