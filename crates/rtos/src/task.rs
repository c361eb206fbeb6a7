//! Task control blocks.
//!
//! A task is a host thread with an RTOS identity: a name, an optional core
//! affinity, a priority that other tasks may change while it runs, and a
//! notification slot. Threads that were not spawned through this module are
//! adopted as unpinned tasks the first time they ask for their own handle.

use core::fmt;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::RtosError;
use crate::port::{self, CoreId};
use crate::primitives::{Notification, NotifyAction};

/// Number of task priority levels (`configMAX_PRIORITIES`).
pub const MAX_PRIORITIES: u8 = 25;
/// Priority of the per-core idle tasks.
pub const IDLE_PRIORITY: u8 = 0;
/// Priority given to adopted threads and to tasks that do not choose one.
pub const DEFAULT_PRIORITY: u8 = 1;
/// Host stack size for spawned tasks.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, or running.
    Ready = 0,
    /// Waiting on a semaphore or notification.
    Blocked = 1,
    /// The task body has returned.
    Deleted = 2,
}

/// Task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

struct TaskControlBlock {
    id: TaskId,
    name: String,
    affinity: Option<CoreId>,
    base_priority: u8,
    priority: AtomicU8,
    state: AtomicU8,
    notification: Notification,
}

/// Shared handle to a task.
#[derive(Clone)]
pub struct TaskHandle(Arc<TaskControlBlock>);

impl TaskHandle {
    fn from_config(config: &TaskConfig) -> Self {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let priority = config.priority.min(MAX_PRIORITIES - 1);
        Self(Arc::new(TaskControlBlock {
            id,
            name: config.name.clone(),
            affinity: config.affinity,
            base_priority: priority,
            priority: AtomicU8::new(priority),
            state: AtomicU8::new(TaskState::Ready as u8),
            notification: Notification::new(),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Core the task is pinned to, or `None` for `tskNO_AFFINITY`.
    pub fn affinity(&self) -> Option<CoreId> {
        self.0.affinity
    }

    /// Priority the task was created with.
    pub fn base_priority(&self) -> u8 {
        self.0.base_priority
    }

    /// Current (possibly raised) priority.
    pub fn priority(&self) -> u8 {
        self.0.priority.load(Ordering::Acquire)
    }

    /// `vTaskPrioritySet`; values above the top level are clamped.
    pub fn set_priority(&self, priority: u8) {
        self.0
            .priority
            .store(priority.min(MAX_PRIORITIES - 1), Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        match self.0.state.load(Ordering::Acquire) {
            0 => TaskState::Ready,
            1 => TaskState::Blocked,
            _ => TaskState::Deleted,
        }
    }

    fn set_state(&self, state: TaskState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    pub fn notification(&self) -> &Notification {
        &self.0.notification
    }

    pub fn notify(&self, value: u32, action: NotifyAction) {
        self.0.notification.notify(value, action);
    }

    pub fn notify_give(&self) {
        self.0.notification.give();
    }

    pub fn notify_give_from_isr(&self) {
        self.0.notification.give_from_isr();
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("affinity", &self.0.affinity)
            .field("priority", &self.priority())
            .finish()
    }
}

/// Configuration for creating a task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub priority: u8,
    pub affinity: Option<CoreId>,
    pub stack_size: usize,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            affinity: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn pinned_to(mut self, core: CoreId) -> Self {
        self.affinity = Some(core);
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }
}

/// A task started with [`spawn`]: its handle plus the host thread running it.
pub struct SpawnedTask {
    handle: TaskHandle,
    thread: JoinHandle<()>,
}

impl SpawnedTask {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Waits for the task body to return.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }

    pub fn into_parts(self) -> (TaskHandle, JoinHandle<()>) {
        (self.handle, self.thread)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskHandle>> = const { RefCell::new(None) };
}

/// Handle of the calling task, without adopting foreign threads.
pub(crate) fn try_current() -> Option<TaskHandle> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Marks the calling task blocked until dropped.
pub(crate) struct BlockedScope(Option<TaskHandle>);

impl BlockedScope {
    pub(crate) fn enter() -> Self {
        let task = try_current();
        if let Some(task) = &task {
            task.set_state(TaskState::Blocked);
        }
        Self(task)
    }
}

impl Drop for BlockedScope {
    fn drop(&mut self) {
        if let Some(task) = &self.0 {
            task.set_state(TaskState::Ready);
        }
    }
}

struct ExitGuard(TaskHandle);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.set_state(TaskState::Deleted);
    }
}

/// Returns the handle of the calling task, adopting the thread if needed.
pub fn current() -> TaskHandle {
    CURRENT.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| {
                let name = thread::current()
                    .name()
                    .map(str::to_owned)
                    .unwrap_or_else(|| String::from("task"));
                TaskHandle::from_config(&TaskConfig::new(name))
            })
            .clone()
    })
}

/// Starts a task on a new host thread.
///
/// The thread binds itself to the task's core (core 0 when unpinned) before
/// running `body`. Core indices are validated by the system, not here.
pub fn spawn<F>(config: TaskConfig, body: F) -> Result<SpawnedTask, RtosError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = TaskHandle::from_config(&config);
    let task = handle.clone();
    let thread = thread::Builder::new()
        .name(config.name.clone())
        .stack_size(config.stack_size)
        .spawn(move || {
            port::bind_core(task.affinity().unwrap_or_default());
            CURRENT.with(|slot| *slot.borrow_mut() = Some(task.clone()));
            let _exit = ExitGuard(task);
            body();
        })?;
    Ok(SpawnedTask { handle, thread })
}
