//! Observer hooks. Shaped like the boxed-closure callback fields used
//! throughout the teacher crate's scheduler rather than a heavier event
//! bus, since each of these has exactly one call site.

use crate::task::TaskType;
use crate::time::TimeTicks;

/// Notified around every task execution.
pub trait TaskObserver: Send + Sync {
    fn will_process_task(&self, task_type: TaskType) {
        let _ = task_type;
    }
    fn did_process_task(&self, task_type: TaskType) {
        let _ = task_type;
    }
}

/// Notified with wall-clock start/end times for non-nested task
/// execution only.
pub trait TaskTimeObserver: Send + Sync {
    fn will_process_task(&self, start: TimeTicks) {
        let _ = start;
    }
    fn did_process_task(&self, start: TimeTicks, end: TimeTicks) {
        let _ = (start, end);
    }
}

/// Notified on nested run loop entry/exit.
pub trait NestingObserver: Send + Sync {
    fn on_begin_nested_run_loop(&self) {}
    fn on_exit_nested_run_loop(&self) {}
}
