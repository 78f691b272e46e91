//! The task data model: what gets posted, what gets accepted, and the
//! ordering keys used to compare two tasks.

use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::enqueue_order::EnqueueOrder;
use crate::time::{TimeDelta, TimeTicks};

/// Whether a task may run while a nested run loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nestable {
    Nestable,
    NonNestable,
}

/// An opaque, user-chosen tag. The engine passes it through to observers
/// untouched and never interprets it (Open Question (1) in SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TaskType(pub u32);

/// A callback that can cross from the posting thread to the main thread.
pub type TaskCallback = Box<dyn FnOnce() + Send + 'static>;

/// A shared flag a producer can use to mark a task canceled after
/// posting it, without needing to reach back into the queue.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A task before it has been accepted by a queue: owned by the producer
/// until handed off via `TaskQueue::post_task`.
pub struct PostedTask {
    pub callback: TaskCallback,
    pub location: &'static Location<'static>,
    pub delay: TimeDelta,
    pub nestable: Nestable,
    pub task_type: TaskType,
    pub is_high_res: bool,
    pub cancel_handle: Option<CancelHandle>,
}

impl PostedTask {
    #[track_caller]
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            location: Location::caller(),
            delay: TimeDelta::zero(),
            nestable: Nestable::Nestable,
            task_type: TaskType::default(),
            is_high_res: false,
            cancel_handle: None,
        }
    }

    pub fn with_delay(mut self, delay: TimeDelta) -> Self {
        self.delay = delay;
        self
    }

    pub fn non_nestable(mut self) -> Self {
        self.nestable = Nestable::NonNestable;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel_handle = Some(handle);
        self
    }
}

/// A `PostedTask` that has been accepted by a queue.
pub struct Task {
    pub callback: Option<TaskCallback>,
    pub location: &'static Location<'static>,
    pub delayed_run_time: TimeTicks,
    pub sequence_num: i32,
    pub enqueue_order: EnqueueOrder,
    pub is_high_res: bool,
    pub nestable: Nestable,
    pub task_type: TaskType,
    pub cancel_handle: Option<CancelHandle>,
}

impl Task {
    pub fn task_order(&self) -> TaskOrder {
        TaskOrder::new(self.enqueue_order, self.delayed_run_time, self.sequence_num)
    }

    /// A task is canceled if its callback was already taken (e.g. it ran)
    /// or its producer-held cancel flag is set.
    pub fn is_canceled(&self) -> bool {
        self.callback.is_none() || self.cancel_handle.as_ref().is_some_and(CancelHandle::is_canceled)
    }

    pub fn set_enqueue_order(&mut self, order: EnqueueOrder) {
        self.enqueue_order = order;
    }
}

/// Strict total order: (enqueue_order, delayed_run_time, sequence_num).
/// A task's position among all tasks is determined entirely by this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOrder {
    enqueue_order: EnqueueOrder,
    delayed_run_time: TimeTicks,
    sequence_num: i32,
}

impl TaskOrder {
    pub fn new(enqueue_order: EnqueueOrder, delayed_run_time: TimeTicks, sequence_num: i32) -> Self {
        Self { enqueue_order, delayed_run_time, sequence_num }
    }

    pub fn enqueue_order(&self) -> EnqueueOrder {
        self.enqueue_order
    }
}

/// Signed-difference comparison that tolerates wraparound near the
/// `i32` boundary, matching the source's sequence-number tiebreak.
fn sequence_num_less(a: i32, b: i32) -> bool {
    a.wrapping_sub(b) < 0
}

impl PartialOrd for TaskOrder {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskOrder {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        if self.enqueue_order != other.enqueue_order {
            return self.enqueue_order.cmp(&other.enqueue_order);
        }
        if self.delayed_run_time != other.delayed_run_time {
            return self.delayed_run_time.cmp(&other.delayed_run_time);
        }
        if self.sequence_num == other.sequence_num {
            return Equal;
        }
        if sequence_num_less(self.sequence_num, other.sequence_num) {
            Less
        } else {
            Greater
        }
    }
}

/// Timer resolution hint; ordering ignores this except as a tiebreaker
/// at equal wake-up times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Resolution {
    High,
    Low,
}

/// A pending wake-up time for a `TaskQueue`, as seen by a `TimeDomain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedWakeUp {
    pub time: TimeTicks,
    pub resolution: Resolution,
}

impl PartialOrd for DelayedWakeUp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedWakeUp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time, self.resolution).cmp(&(other.time, other.resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(e: u64, t: i64, s: i32) -> TaskOrder {
        TaskOrder::new(EnqueueOrder::from_raw_for_test(e), TimeTicks::from_micros(t), s)
    }

    #[test]
    fn compares_enqueue_order_first() {
        assert!(order(2, 100, 0) < order(3, 0, 0));
    }

    #[test]
    fn ties_break_on_delayed_run_time() {
        assert!(order(2, 0, 5) < order(2, 100, 0));
    }

    #[test]
    fn ties_break_on_sequence_num_tolerating_wrap() {
        assert!(order(2, 0, i32::MAX) < order(2, 0, i32::MIN));
    }

    #[test]
    fn is_a_strict_total_order() {
        let a = order(2, 0, 0);
        let b = order(3, 0, 0);
        assert_ne!(a, b);
        assert!(a < b || b < a);
    }
}
