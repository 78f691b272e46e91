//! Cross-thread holding pen for queues whose owning handle is dropped
//! off-thread while tasks may still be in flight.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::task_queue::TaskQueueState;

#[derive(Default)]
struct Inner {
    queues: Vec<Arc<TaskQueueState>>,
    manager_deleted: bool,
}

/// Safe from any thread. `gracefully_shutdown_task_queue` is called by a
/// `TaskQueue`'s `Drop` when the drop happens off the associated thread;
/// the helper keeps the queue alive until the main thread next drains it
/// via `take_queues` (from `SequenceManager::clean_up_queues`).
#[derive(Default)]
pub(crate) struct GracefulQueueShutdownHelper {
    inner: Mutex<Inner>,
}

impl GracefulQueueShutdownHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gracefully_shutdown_task_queue(&self, queue: Arc<TaskQueueState>) {
        let mut inner = self.inner.lock();
        if inner.manager_deleted {
            // Dropping `queue` here must not touch SequenceManager state;
            // it doesn't, since TaskQueueState only holds a Weak back-ref.
            return;
        }
        inner.queues.push(queue);
    }

    pub fn on_sequence_manager_deleted(&self) {
        let mut inner = self.inner.lock();
        inner.manager_deleted = true;
        inner.queues.clear();
    }

    pub fn take_queues(&self) -> Vec<Arc<TaskQueueState>> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.queues)
    }
}
