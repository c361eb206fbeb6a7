//! IPC service configuration.

use smp_rtos::MAX_PRIORITIES;

/// Stack size of each worker task.
pub const IPC_STACK_SIZE: usize = 128 * 1024;

/// How a worker's priority relates to the tasks that call into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityPolicy {
    /// Workers start low and take on the priority of each caller. Every core
    /// has its own call mutex.
    #[default]
    CallersPriority,
    /// Workers run at a fixed priority and one call mutex serializes callers
    /// of every core.
    Fixed,
}

/// How a caller wakes the worker of the target core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeStrategy {
    /// Direct-to-task notification carrying the wait-mode bits.
    #[default]
    Notify,
    /// A per-core binary wake semaphore; the wait mode travels with the request.
    Semaphore,
}

/// Configuration for [`Ipc`](crate::Ipc).
#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub priority_policy: PriorityPolicy,
    pub wake: WakeStrategy,
    /// Worker priority under [`PriorityPolicy::Fixed`].
    pub task_priority: u8,
    pub task_stack_size: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            priority_policy: PriorityPolicy::default(),
            wake: WakeStrategy::default(),
            task_priority: MAX_PRIORITIES - 1,
            task_stack_size: IPC_STACK_SIZE,
        }
    }
}

impl IpcConfig {
    pub fn builder() -> IpcConfigBuilder {
        IpcConfigBuilder::default()
    }
}

/// Builder for [`IpcConfig`].
#[derive(Debug, Default)]
pub struct IpcConfigBuilder {
    config: IpcConfig,
}

impl IpcConfigBuilder {
    pub fn priority_policy(mut self, policy: PriorityPolicy) -> Self {
        self.config.priority_policy = policy;
        self
    }

    pub fn wake(mut self, wake: WakeStrategy) -> Self {
        self.config.wake = wake;
        self
    }

    pub fn task_priority(mut self, priority: u8) -> Self {
        self.config.task_priority = priority.min(MAX_PRIORITIES - 1);
        self
    }

    pub fn task_stack_size(mut self, size: usize) -> Self {
        self.config.task_stack_size = size;
        self
    }

    pub fn build(self) -> IpcConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_callers_priority() {
        let config = IpcConfig::default();
        assert_eq!(config.priority_policy, PriorityPolicy::CallersPriority);
        assert_eq!(config.wake, WakeStrategy::Notify);
        assert_eq!(config.task_priority, MAX_PRIORITIES - 1);
    }

    #[test]
    fn builder_clamps_priority() {
        let config = IpcConfig::builder()
            .priority_policy(PriorityPolicy::Fixed)
            .wake(WakeStrategy::Semaphore)
            .task_priority(99)
            .build();
        assert_eq!(config.priority_policy, PriorityPolicy::Fixed);
        assert_eq!(config.wake, WakeStrategy::Semaphore);
        assert_eq!(config.task_priority, MAX_PRIORITIES - 1);
    }
}
