//! Per-priority index from `WorkQueue` to the one with the oldest ready
//! task, backed by one `IntrusiveHeap` per priority.

use std::sync::Arc;

use crate::intrusive_heap::{HeapHandle, HeapItem, IntrusiveHeap};
use crate::selector::{QueuePriority, ALL_PRIORITIES, QUEUE_PRIORITY_COUNT};
use crate::task::TaskOrder;
use crate::task_queue::TaskQueueState;
use crate::work_queue::WorkQueueKind;

struct HeapEntry {
    order: TaskOrder,
    queue: Arc<TaskQueueState>,
    kind: WorkQueueKind,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.order.partial_cmp(&other.order)
    }
}

impl HeapItem for HeapEntry {
    fn set_heap_handle(&mut self, handle: HeapHandle) {
        self.queue.set_work_queue_heap_handle(self.kind, Some(handle));
    }

    fn clear_heap_handle(&mut self) {
        self.queue.set_work_queue_heap_handle(self.kind, None);
    }
}

/// One `IntrusiveHeap` per `QueuePriority`, scoped to a single
/// `WorkQueueKind` (the selector owns one `WorkQueueSets` for immediate
/// work and one for delayed work).
pub(crate) struct WorkQueueSets {
    heaps: [IntrusiveHeap<HeapEntry>; QUEUE_PRIORITY_COUNT],
}

impl WorkQueueSets {
    pub fn new() -> Self {
        Self { heaps: std::array::from_fn(|_| IntrusiveHeap::new()) }
    }

    fn heap(&mut self, priority: QueuePriority) -> &mut IntrusiveHeap<HeapEntry> {
        &mut self.heaps[priority.index()]
    }

    /// Inserts `queue` into `priority`'s heap iff it currently has a
    /// visible front task. Used when a queue transitions from disabled
    /// to enabled, or is newly registered.
    pub fn add_queue(&mut self, queue: Arc<TaskQueueState>, kind: WorkQueueKind, priority: QueuePriority, front_order: Option<TaskOrder>) {
        if let Some(order) = front_order {
            self.heap(priority).insert(HeapEntry { order, queue, kind });
        }
    }

    pub fn remove_queue(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind) {
        if let Some(handle) = queue.work_queue_heap_handle(kind) {
            let priority = queue.work_queue_set_index(kind);
            self.heap(priority).erase(handle);
        }
    }

    /// Moves `queue`'s entry (if present) to `new_priority`'s heap.
    pub fn change_set_index(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, old_priority: QueuePriority, new_priority: QueuePriority) {
        let Some(handle) = queue.work_queue_heap_handle(kind) else { return };
        self.heaps[old_priority.index()].erase(handle);
        let order = queue.front_task_order(kind).expect("queue had a heap handle but no front task order");
        self.heaps[new_priority.index()].insert(HeapEntry { order, queue: queue.clone(), kind });
    }

    pub fn on_queues_front_task_changed(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, new_order: TaskOrder) {
        let priority = queue.work_queue_set_index(kind);
        if let Some(handle) = queue.work_queue_heap_handle(kind) {
            self.heap(priority).change_key(handle, HeapEntry { order: new_order, queue: queue.clone(), kind });
        } else {
            self.heap(priority).insert(HeapEntry { order: new_order, queue: queue.clone(), kind });
        }
    }

    pub fn on_task_pushed_to_empty_queue(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, order: TaskOrder) {
        debug_assert!(queue.work_queue_heap_handle(kind).is_none(), "queue already present in WorkQueueSets");
        let priority = queue.work_queue_set_index(kind);
        self.heap(priority).insert(HeapEntry { order, queue: queue.clone(), kind });
    }

    /// `queue` is the current min of its priority's heap; either re-key
    /// it to its new front or remove it if it's now empty.
    pub fn on_pop_min_queue_in_set(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, new_front: Option<TaskOrder>) {
        let priority = queue.work_queue_set_index(kind);
        match new_front {
            Some(order) => {
                self.heap(priority).replace_min(HeapEntry { order, queue: queue.clone(), kind });
            }
            None => {
                self.heap(priority).pop();
            }
        }
    }

    pub fn on_queue_blocked(&mut self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind) {
        self.remove_queue(queue, kind);
    }

    pub fn get_oldest_queue_and_task_order(&self, priority: QueuePriority) -> Option<(Arc<TaskQueueState>, TaskOrder)> {
        let entry = self.heaps[priority.index()].min()?;
        Some((entry.queue.clone(), entry.order))
    }

    pub fn is_set_empty(&self, priority: QueuePriority) -> bool {
        self.heaps[priority.index()].is_empty()
    }

    pub fn is_empty_across_all_priorities(&self) -> bool {
        ALL_PRIORITIES.iter().all(|&p| self.is_set_empty(p))
    }
}

impl Default for WorkQueueSets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associated_thread::AssociatedThreadId;
    use crate::enqueue_order::EnqueueOrderGenerator;
    use crate::task_queue::{TaskQueueSpec, TaskQueueState};
    use crate::time::TimeTicks;
    use crate::time_domain::TimeDomain;

    fn test_queue(priority: QueuePriority) -> Arc<TaskQueueState> {
        TaskQueueState::new(
            TaskQueueSpec::new("q").with_priority(priority),
            AssociatedThreadId::create_bound(),
            Arc::new(EnqueueOrderGenerator::new()),
            Arc::new(TimeDomain::real()),
        )
    }

    fn order(e: u64) -> TaskOrder {
        use crate::enqueue_order::EnqueueOrder;
        TaskOrder::new(EnqueueOrder::from_raw_for_test(e), TimeTicks::zero(), 0)
    }

    #[test]
    fn oldest_across_two_queues_is_the_min() {
        let mut sets = WorkQueueSets::new();
        let q1 = test_queue(QueuePriority::Normal);
        let q2 = test_queue(QueuePriority::Normal);
        sets.add_queue(q1.clone(), WorkQueueKind::Immediate, QueuePriority::Normal, Some(order(5)));
        sets.add_queue(q2.clone(), WorkQueueKind::Immediate, QueuePriority::Normal, Some(order(2)));
        let (oldest, task_order) = sets.get_oldest_queue_and_task_order(QueuePriority::Normal).unwrap();
        assert!(Arc::ptr_eq(&oldest, &q2));
        assert_eq!(task_order, order(2));
    }

    #[test]
    fn remove_queue_empties_the_set() {
        let mut sets = WorkQueueSets::new();
        let q1 = test_queue(QueuePriority::High);
        sets.add_queue(q1.clone(), WorkQueueKind::Delayed, QueuePriority::High, Some(order(1)));
        assert!(!sets.is_set_empty(QueuePriority::High));
        sets.remove_queue(&q1, WorkQueueKind::Delayed);
        assert!(sets.is_set_empty(QueuePriority::High));
    }

    #[test]
    fn distinct_priorities_stay_isolated() {
        let mut sets = WorkQueueSets::new();
        let q1 = test_queue(QueuePriority::Low);
        sets.add_queue(q1, WorkQueueKind::Immediate, QueuePriority::Low, Some(order(9)));
        assert!(sets.is_set_empty(QueuePriority::Normal));
        assert!(!sets.is_set_empty(QueuePriority::Low));
    }
}
