//! Fences: TaskOrder-valued markers that gate a `WorkQueue`'s execution
//! window.

use crate::enqueue_order::EnqueueOrder;
use crate::task::TaskOrder;
use crate::time::TimeTicks;

/// Blocks tasks whose `TaskOrder` is `>=` the fence's. At most one fence
/// per `TaskQueue` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    task_order: TaskOrder,
}

impl Fence {
    pub fn from_task_order(task_order: TaskOrder) -> Self {
        Self { task_order }
    }

    /// A fence that blocks every task, since `enqueue_order = 1` is less
    /// than every real task's order.
    pub fn blocking() -> Self {
        Self { task_order: TaskOrder::new(EnqueueOrder::blocking_fence(), TimeTicks::zero(), 0) }
    }

    pub fn task_order(&self) -> TaskOrder {
        self.task_order
    }

    pub fn is_blocking(&self) -> bool {
        self.task_order.enqueue_order() == EnqueueOrder::blocking_fence()
    }

    /// Whether a task with the given order is blocked by this fence.
    pub fn blocks(&self, order: TaskOrder) -> bool {
        order >= self.task_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_fence_blocks_every_real_order() {
        let fence = Fence::blocking();
        let order = TaskOrder::new(EnqueueOrder::from_raw_for_test(2), TimeTicks::zero(), 0);
        assert!(fence.blocks(order));
    }
}
