//! A FIFO of tasks for one `(TaskQueue, WorkQueueKind)` pair, with an
//! optional fence that can mask its head from the selector.

use std::collections::VecDeque;

use crate::fence::Fence;
use crate::intrusive_heap::HeapHandle;
use crate::selector::QueuePriority;
use crate::task::{Task, TaskOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkQueueKind {
    Immediate,
    Delayed,
}

/// What a mutation did to the queue's visibility in `WorkQueueSets`.
/// Notification into the sets happens one layer up, outside whatever
/// lock guards this state — observers are never called under a lock.
pub(crate) enum PushOutcome {
    /// The queue's visible front didn't change; no notification needed.
    NoChange,
    /// The queue was not visible (empty or blocked) and now is.
    BecameReady(TaskOrder),
}

pub(crate) enum FrontPushOutcome {
    /// Still not visible (e.g. still blocked by fence).
    None,
    /// Was not visible, now is.
    PushedToEmpty(TaskOrder),
    /// Was already visible; its front task order changed.
    FrontChanged(TaskOrder),
}

pub(crate) enum FenceOutcome {
    /// The fence lifted a previous block; the queue is now visible.
    Unblocked(TaskOrder),
    /// The fence newly blocks a previously visible queue.
    Blocked,
    NoChange,
}

pub(crate) struct WorkQueueState {
    kind: WorkQueueKind,
    tasks: VecDeque<Task>,
    fence: Option<Fence>,
    pub(crate) heap_handle: Option<HeapHandle>,
    pub(crate) set_index: QueuePriority,
}

impl WorkQueueState {
    pub fn new(kind: WorkQueueKind, initial_priority: QueuePriority) -> Self {
        Self { kind, tasks: VecDeque::new(), fence: None, heap_handle: None, set_index: initial_priority }
    }

    pub fn kind(&self) -> WorkQueueKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_deque_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// True iff a fence is set and it masks the front, or a fence is set
    /// on an empty deque (no front to mask, but still not servable).
    pub fn is_blocked(&self) -> bool {
        match (&self.fence, self.tasks.front()) {
            (Some(fence), Some(front)) => fence.blocks(front.task_order()),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    pub fn fence(&self) -> Option<Fence> {
        self.fence
    }

    /// `Some(order)` iff non-empty and not blocked by fence.
    pub fn front_task_order(&self) -> Option<TaskOrder> {
        if self.is_blocked() {
            None
        } else {
            self.tasks.front().map(Task::task_order)
        }
    }

    pub fn push(&mut self, task: Task) -> PushOutcome {
        let was_visible = self.front_task_order().is_some();
        self.tasks.push_back(task);
        if was_visible {
            return PushOutcome::NoChange;
        }
        match self.front_task_order() {
            Some(order) => PushOutcome::BecameReady(order),
            None => PushOutcome::NoChange,
        }
    }

    /// Push to the front, preserving the invariant that the new front's
    /// `enqueue_order` is `<=` the previous front's.
    pub fn push_non_nestable_to_front(&mut self, task: Task) -> FrontPushOutcome {
        let was_visible = self.front_task_order().is_some();
        self.tasks.push_front(task);
        match self.front_task_order() {
            None => FrontPushOutcome::None,
            Some(order) => {
                if was_visible {
                    FrontPushOutcome::FrontChanged(order)
                } else {
                    FrontPushOutcome::PushedToEmpty(order)
                }
            }
        }
    }

    /// Pop the front task. The caller (the owning `TaskQueueState`) is
    /// responsible for any immediate-queue reload and for notifying
    /// `WorkQueueSets` with the resulting `front_task_order()`.
    pub fn take_front(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn remove_all_canceled_from_front(&mut self) -> bool {
        let mut removed = false;
        while matches!(self.tasks.front(), Some(t) if t.is_canceled()) {
            self.tasks.pop_front();
            removed = true;
        }
        removed
    }

    pub fn insert_fence(&mut self, fence: Fence) -> FenceOutcome {
        let was_visible = self.front_task_order().is_some();
        self.fence = Some(fence);
        let now_visible = self.front_task_order().is_some();
        match (was_visible, now_visible) {
            (false, true) => FenceOutcome::Unblocked(self.front_task_order().unwrap()),
            (true, false) => FenceOutcome::Blocked,
            _ => FenceOutcome::NoChange,
        }
    }

    /// Returns the new front order if removing the fence makes the queue
    /// visible for the first time.
    pub fn remove_fence(&mut self) -> Option<TaskOrder> {
        let was_visible = self.front_task_order().is_some();
        self.fence = None;
        if was_visible {
            return None;
        }
        self.front_task_order()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue_order::EnqueueOrder;
    use crate::task::{Nestable, TaskType};
    use crate::time::TimeTicks;

    fn task(order: u64) -> Task {
        Task {
            callback: Some(Box::new(|| {})),
            location: std::panic::Location::caller(),
            delayed_run_time: TimeTicks::zero(),
            sequence_num: 0,
            enqueue_order: EnqueueOrder::from_raw_for_test(order),
            is_high_res: false,
            nestable: Nestable::Nestable,
            task_type: TaskType::default(),
            cancel_handle: None,
        }
    }

    #[test]
    fn push_to_empty_becomes_ready() {
        let mut wq = WorkQueueState::new(WorkQueueKind::Immediate, QueuePriority::Normal);
        match wq.push(task(2)) {
            PushOutcome::BecameReady(_) => {}
            _ => panic!("expected BecameReady"),
        }
        match wq.push(task(3)) {
            PushOutcome::NoChange => {}
            _ => panic!("expected NoChange, queue already visible"),
        }
    }

    #[test]
    fn fence_blocks_and_unblocks() {
        let mut wq = WorkQueueState::new(WorkQueueKind::Immediate, QueuePriority::Normal);
        wq.push(task(2));
        let fence = Fence::blocking();
        match wq.insert_fence(fence) {
            FenceOutcome::Blocked => {}
            _ => panic!("expected Blocked"),
        }
        assert!(wq.front_task_order().is_none());
        let unblocked = wq.remove_fence();
        assert!(unblocked.is_some());
        assert!(wq.front_task_order().is_some());
    }

    #[test]
    fn remove_all_canceled_from_front() {
        let mut wq = WorkQueueState::new(WorkQueueKind::Immediate, QueuePriority::Normal);
        let mut t1 = task(2);
        t1.callback = None;
        wq.push(t1);
        wq.push(task(3));
        assert!(wq.remove_all_canceled_from_front());
        assert_eq!(wq.len(), 1);
    }
}
