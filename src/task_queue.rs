//! The logical queue: two incoming buffers, two `WorkQueue`s, fence
//! management, the enabled/voter refcount pair, and the public
//! `TaskQueue` handle producers and embedders actually hold.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::associated_thread::AssociatedThreadId;
use crate::enqueue_order::{EnqueueOrder, EnqueueOrderGenerator};
use crate::error::{Result, SchedulerError};
use crate::fence::Fence;
use crate::intrusive_heap::HeapHandle;
use crate::selector::QueuePriority;
use crate::task::{DelayedWakeUp, PostedTask, Resolution, Task, TaskOrder};
use crate::time::TimeTicks;
use crate::time_domain::TimeDomain;
use crate::work_queue::{FenceOutcome, FrontPushOutcome, PushOutcome, WorkQueueKind, WorkQueueState};

/// Where a fence should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencePosition {
    /// Blocks everything posted from now on; lets through what's already
    /// queued with an order before this call.
    Now,
    /// Blocks every task, present and future, until removed.
    BeginningOfTime,
}

/// What a queue is created with.
#[derive(Debug, Clone)]
pub struct TaskQueueSpec {
    pub name: String,
    pub priority: QueuePriority,
}

impl TaskQueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), priority: QueuePriority::Normal }
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Narrow upward notification surface a `TaskQueueState` uses to keep
/// `WorkQueueSets`/the host controller informed, without either owning
/// the other. Implemented by the owning `SequenceManager`.
pub(crate) trait TaskQueueHost: Send + Sync {
    fn on_work_queue_became_ready(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, order: TaskOrder);
    fn on_work_queue_front_changed(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, order: TaskOrder);
    fn on_work_queue_blocked(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind);
    fn on_work_queue_popped_min(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind);
    fn on_queue_enabled(&self, queue: &Arc<TaskQueueState>);
    fn on_queue_disabled(&self, queue: &Arc<TaskQueueState>);
    fn on_queue_priority_changed(&self, queue: &Arc<TaskQueueState>, new_priority: QueuePriority);
    fn on_queue_has_incoming_immediate_work(&self, queue: &Arc<TaskQueueState>, order: EnqueueOrder, queue_is_blocked: bool);
    fn request_do_work(&self);
}

/// A delayed-incoming entry, ordered by `(delayed_run_time, sequence_num)`
/// for the main-thread-only incoming priority queue. Wrapped in `Reverse`
/// by the caller to get min-heap behavior from `std::collections::BinaryHeap`.
struct DelayedIncomingTask(Task);

impl PartialEq for DelayedIncomingTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.delayed_run_time == other.0.delayed_run_time && self.0.sequence_num == other.0.sequence_num
    }
}
impl Eq for DelayedIncomingTask {}

impl PartialOrd for DelayedIncomingTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedIncomingTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.delayed_run_time, self.0.sequence_num).cmp(&(other.0.delayed_run_time, other.0.sequence_num))
    }
}

/// Everything a `TaskQueue` owns, shared via `Arc` between its public
/// handle, the selector's `WorkQueueSets`, and the owning
/// `SequenceManager`'s registry. See SPEC_FULL.md §9 for why `Arc`
/// everywhere rather than an index/slab scheme.
pub struct TaskQueueState {
    name: String,
    associated_thread: Arc<AssociatedThreadId>,
    enqueue_order_generator: Arc<EnqueueOrderGenerator>,
    host: Mutex<Option<Weak<dyn TaskQueueHost>>>,

    priority: Mutex<QueuePriority>,
    time_domain: Mutex<Arc<TimeDomain>>,

    immediate_incoming: Mutex<VecDeque<Task>>,
    delayed_incoming: Mutex<BinaryHeap<Reverse<DelayedIncomingTask>>>,

    immediate_work_queue: Mutex<WorkQueueState>,
    delayed_work_queue: Mutex<WorkQueueState>,

    current_fence: Mutex<Option<Fence>>,
    delayed_fence_threshold: Mutex<Option<TimeTicks>>,

    sequence_num_generator: AtomicI32,

    enabled_ref_count: AtomicI32,
    voter_ref_count: AtomicI32,

    wake_up_heap_handle: Mutex<Option<HeapHandle>>,
    last_reported_wake_up: Mutex<Option<DelayedWakeUp>>,

    shut_down: std::sync::atomic::AtomicBool,
}

impl TaskQueueState {
    pub(crate) fn new(
        spec: TaskQueueSpec,
        associated_thread: Arc<AssociatedThreadId>,
        enqueue_order_generator: Arc<EnqueueOrderGenerator>,
        time_domain: Arc<TimeDomain>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name,
            associated_thread,
            enqueue_order_generator,
            host: Mutex::new(None),
            priority: Mutex::new(spec.priority),
            time_domain: Mutex::new(time_domain),
            immediate_incoming: Mutex::new(VecDeque::new()),
            delayed_incoming: Mutex::new(BinaryHeap::new()),
            immediate_work_queue: Mutex::new(WorkQueueState::new(WorkQueueKind::Immediate, spec.priority)),
            delayed_work_queue: Mutex::new(WorkQueueState::new(WorkQueueKind::Delayed, spec.priority)),
            sequence_num_generator: AtomicI32::new(0),
            current_fence: Mutex::new(None),
            delayed_fence_threshold: Mutex::new(None),
            enabled_ref_count: AtomicI32::new(0),
            voter_ref_count: AtomicI32::new(0),
            wake_up_heap_handle: Mutex::new(None),
            last_reported_wake_up: Mutex::new(None),
            shut_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Builds a queue with no host attached, for tests of other modules
    /// that only need a plausible `Arc<TaskQueueState>` to reference —
    /// notifications silently no-op.
    #[cfg(test)]
    pub(crate) fn new_detached_for_test(
        name: String,
        priority: QueuePriority,
        associated_thread: Arc<AssociatedThreadId>,
        enqueue_order_generator: Arc<EnqueueOrderGenerator>,
        time_domain: Arc<TimeDomain>,
    ) -> Arc<Self> {
        Self::new(TaskQueueSpec { name, priority }, associated_thread, enqueue_order_generator, time_domain)
    }

    pub(crate) fn bind_host(&self, host: Weak<dyn TaskQueueHost>) {
        *self.host.lock() = Some(host);
    }

    fn host(&self) -> Option<Arc<dyn TaskQueueHost>> {
        self.host.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> QueuePriority {
        *self.priority.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled_ref_count.load(Ordering::Acquire) == self.voter_ref_count.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn wake_up_heap_handle(&self) -> Option<HeapHandle> {
        *self.wake_up_heap_handle.lock()
    }

    pub(crate) fn set_wake_up_heap_handle(&self, handle: Option<HeapHandle>) {
        *self.wake_up_heap_handle.lock() = handle;
    }

    fn work_queue(&self, kind: WorkQueueKind) -> &Mutex<WorkQueueState> {
        match kind {
            WorkQueueKind::Immediate => &self.immediate_work_queue,
            WorkQueueKind::Delayed => &self.delayed_work_queue,
        }
    }

    pub(crate) fn work_queue_heap_handle(&self, kind: WorkQueueKind) -> Option<HeapHandle> {
        self.work_queue(kind).lock().heap_handle
    }

    pub(crate) fn set_work_queue_heap_handle(&self, kind: WorkQueueKind, handle: Option<HeapHandle>) {
        self.work_queue(kind).lock().heap_handle = handle;
    }

    pub(crate) fn work_queue_set_index(&self, kind: WorkQueueKind) -> QueuePriority {
        self.work_queue(kind).lock().set_index
    }

    pub(crate) fn set_work_queue_set_index(&self, kind: WorkQueueKind, priority: QueuePriority) {
        self.work_queue(kind).lock().set_index = priority;
    }

    pub fn time_domain(&self) -> Arc<TimeDomain> {
        self.time_domain.lock().clone()
    }

    pub fn set_time_domain(self: &Arc<Self>, time_domain: Arc<TimeDomain>) {
        let now = time_domain.now();
        let old = std::mem::replace(&mut *self.time_domain.lock(), time_domain);
        old.unregister_queue(self, now);
    }

    // ---- submission ----

    pub fn post_task(self: &Arc<Self>, posted_task: PostedTask) -> Result<()> {
        if self.is_shut_down() {
            return Err(SchedulerError::QueueShutDown { queue: self.name.clone() });
        }
        if posted_task.delay.is_zero() {
            self.post_immediate(posted_task);
        } else {
            self.post_delayed(posted_task);
        }
        Ok(())
    }

    fn post_immediate(self: &Arc<Self>, posted_task: PostedTask) {
        let enqueue_order = self.enqueue_order_generator.next();
        let task = Task {
            callback: Some(posted_task.callback),
            location: posted_task.location,
            delayed_run_time: TimeTicks::zero(),
            sequence_num: self.sequence_num_generator.fetch_add(1, Ordering::Relaxed),
            enqueue_order,
            is_high_res: posted_task.is_high_res,
            nestable: posted_task.nestable,
            task_type: posted_task.task_type,
            cancel_handle: posted_task.cancel_handle,
        };

        let became_linked = {
            let mut incoming = self.immediate_incoming.lock();
            let was_empty = incoming.is_empty();
            incoming.push_back(task);
            was_empty
        };

        trace!(queue = %self.name, %enqueue_order, "post_immediate");

        if became_linked {
            if let Some(host) = self.host() {
                let queue_is_blocked = self.associated_thread.is_bound_to_current_thread()
                    && (!self.is_enabled() || self.current_fence.lock().is_some());
                host.on_queue_has_incoming_immediate_work(self, enqueue_order, queue_is_blocked);
            }
        }
    }

    fn post_delayed(self: &Arc<Self>, posted_task: PostedTask) {
        let delayed_run_time = self.time_domain().now() + posted_task.delay;
        let task = Task {
            callback: Some(posted_task.callback),
            location: posted_task.location,
            delayed_run_time,
            sequence_num: self.sequence_num_generator.fetch_add(1, Ordering::Relaxed),
            enqueue_order: EnqueueOrder::none(),
            is_high_res: posted_task.is_high_res,
            nestable: posted_task.nestable,
            task_type: posted_task.task_type,
            cancel_handle: posted_task.cancel_handle,
        };

        if self.associated_thread.is_bound_to_current_thread() {
            self.delayed_incoming.lock().push(Reverse(DelayedIncomingTask(task)));
            let now = self.time_domain().now();
            self.update_delayed_wake_up(now);
        } else {
            // Off-thread slow path: route through the immediate buffer as a
            // surrogate task that re-inserts itself on the main thread.
            let now = self.time_domain().now();
            if delayed_run_time <= now {
                self.wake_up_for_delayed_work_with(now, std::iter::once(task));
            } else {
                self.delayed_incoming.lock().push(Reverse(DelayedIncomingTask(task)));
                let enqueue_order = self.enqueue_order_generator.next();
                if let Some(host) = self.host() {
                    host.on_queue_has_incoming_immediate_work(self, enqueue_order, false);
                }
            }
        }
    }

    // ---- delayed wake-up handling ----

    /// Moves every delayed-incoming entry whose `delayed_run_time <= now`
    /// into the delayed `WorkQueue`, then recomputes the next wake-up.
    /// Called by `SequenceManager` for queues returned from
    /// `TimeDomain::move_ready_delayed_tasks_to_work_queues`.
    pub(crate) fn wake_up_for_delayed_work(self: &Arc<Self>, now: TimeTicks) {
        let ready = self.drain_ready_delayed_incoming(now);
        self.wake_up_for_delayed_work_with(now, ready.into_iter());
    }

    fn drain_ready_delayed_incoming(&self, now: TimeTicks) -> Vec<Task> {
        let mut incoming = self.delayed_incoming.lock();
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = incoming.peek() {
            if entry.0.delayed_run_time > now {
                break;
            }
            let Reverse(entry) = incoming.pop().unwrap();
            ready.push(entry.0);
        }
        ready
    }

    fn wake_up_for_delayed_work_with(self: &Arc<Self>, now: TimeTicks, ready: impl Iterator<Item = Task>) {
        let threshold = *self.delayed_fence_threshold.lock();

        for mut task in ready {
            if task.is_canceled() {
                continue;
            }
            task.set_enqueue_order(self.enqueue_order_generator.next());

            if let Some(threshold) = threshold {
                if task.delayed_run_time >= threshold {
                    let order = task.enqueue_order;
                    *self.current_fence.lock() = Some(Fence::from_task_order(TaskOrder::new(order, TimeTicks::zero(), 0)));
                    *self.delayed_fence_threshold.lock() = None;
                }
            }

            let outcome = self.delayed_work_queue.lock().push(task);
            self.propagate_push_outcome(WorkQueueKind::Delayed, outcome);
        }

        self.update_delayed_wake_up(now);
    }

    pub(crate) fn update_delayed_wake_up(self: &Arc<Self>, now: TimeTicks) {
        let next_wake_up = if !self.is_enabled() {
            None
        } else {
            self.delayed_incoming.lock().peek().map(|Reverse(entry)| DelayedWakeUp {
                time: entry.0.delayed_run_time,
                resolution: if entry.0.is_high_res { Resolution::High } else { Resolution::Low },
            })
        };

        let mut last = self.last_reported_wake_up.lock();
        if *last == next_wake_up {
            return;
        }
        *last = next_wake_up;
        drop(last);

        self.time_domain().set_next_wake_up_for_queue(self, next_wake_up, now);
    }

    // ---- fences ----

    pub fn insert_fence(self: &Arc<Self>, position: FencePosition) {
        let fence = match position {
            FencePosition::Now => {
                let order = self.enqueue_order_generator.next();
                Fence::from_task_order(TaskOrder::new(order, TimeTicks::zero(), 0))
            }
            FencePosition::BeginningOfTime => Fence::blocking(),
        };
        self.apply_fence(fence);
    }

    /// Arms a fence that activates only once a ready delayed task's
    /// `delayed_run_time` crosses `time`.
    pub fn insert_fence_at(&self, time: TimeTicks) {
        *self.delayed_fence_threshold.lock() = Some(time);
    }

    fn apply_fence(self: &Arc<Self>, fence: Fence) {
        *self.current_fence.lock() = Some(fence);

        let immediate_outcome = self.immediate_work_queue.lock().insert_fence(fence);
        self.propagate_fence_outcome(WorkQueueKind::Immediate, immediate_outcome);

        let delayed_outcome = self.delayed_work_queue.lock().insert_fence(fence);
        self.propagate_fence_outcome(WorkQueueKind::Delayed, delayed_outcome);
    }

    pub fn remove_fence(self: &Arc<Self>) {
        *self.current_fence.lock() = None;
        *self.delayed_fence_threshold.lock() = None;

        if let Some(order) = self.immediate_work_queue.lock().remove_fence() {
            if let Some(host) = self.host() {
                host.on_work_queue_became_ready(self, WorkQueueKind::Immediate, order);
            }
        }
        if let Some(order) = self.delayed_work_queue.lock().remove_fence() {
            if let Some(host) = self.host() {
                host.on_work_queue_became_ready(self, WorkQueueKind::Delayed, order);
            }
        }
    }

    pub fn has_active_fence(&self) -> bool {
        self.current_fence.lock().is_some()
    }

    pub fn blocked_by_fence(&self) -> bool {
        self.current_fence.lock().is_some()
            && self.immediate_work_queue.lock().is_blocked()
            && self.delayed_work_queue.lock().is_blocked()
    }

    fn propagate_push_outcome(self: &Arc<Self>, kind: WorkQueueKind, outcome: PushOutcome) {
        if let PushOutcome::BecameReady(order) = outcome {
            if let Some(host) = self.host() {
                host.on_work_queue_became_ready(self, kind, order);
            }
        }
    }

    fn propagate_front_push_outcome(self: &Arc<Self>, kind: WorkQueueKind, outcome: FrontPushOutcome) {
        let Some(host) = self.host() else { return };
        match outcome {
            FrontPushOutcome::None => {}
            FrontPushOutcome::PushedToEmpty(order) => host.on_work_queue_became_ready(self, kind, order),
            FrontPushOutcome::FrontChanged(order) => host.on_work_queue_front_changed(self, kind, order),
        }
    }

    fn propagate_fence_outcome(self: &Arc<Self>, kind: WorkQueueKind, outcome: FenceOutcome) {
        let Some(host) = self.host() else { return };
        match outcome {
            FenceOutcome::Unblocked(order) => host.on_work_queue_became_ready(self, kind, order),
            FenceOutcome::Blocked => host.on_work_queue_blocked(self, kind),
            FenceOutcome::NoChange => {}
        }
    }

    // ---- priority / enable-disable ----

    pub fn set_queue_priority(self: &Arc<Self>, new_priority: QueuePriority) {
        *self.priority.lock() = new_priority;
        if self.is_enabled() {
            if let Some(host) = self.host() {
                host.on_queue_priority_changed(self, new_priority);
            }
        } else {
            self.immediate_work_queue.lock().set_index = new_priority;
            self.delayed_work_queue.lock().set_index = new_priority;
        }
    }

    pub fn create_queue_enabled_voter(self: &Arc<Self>) -> QueueEnabledVoter {
        self.voter_ref_count.fetch_add(1, Ordering::AcqRel);
        self.enabled_ref_count.fetch_add(1, Ordering::AcqRel);
        QueueEnabledVoter { queue: self.clone(), voted_enabled: true }
    }

    fn on_enabled_state_changed(self: &Arc<Self>, now_enabled: bool) {
        let Some(host) = self.host() else { return };
        if now_enabled {
            host.on_queue_enabled(self);
            if self.immediate_work_queue.lock().front_task_order().is_some() && self.current_fence.lock().is_none() {
                host.request_do_work();
            }
        } else {
            host.on_queue_disabled(self);
        }
    }

    // ---- maintenance ----

    pub fn sweep_canceled_delayed_tasks(self: &Arc<Self>, now: TimeTicks) {
        let mut incoming = self.delayed_incoming.lock();
        let survivors: BinaryHeap<Reverse<DelayedIncomingTask>> =
            std::mem::take(&mut *incoming).into_iter().filter(|Reverse(t)| !t.0.is_canceled()).collect();
        *incoming = survivors;
        drop(incoming);
        self.update_delayed_wake_up(now);
    }

    /// Called by `SequenceManager` before selection: reloads the
    /// immediate `WorkQueue` from the incoming buffer if it is empty.
    pub(crate) fn reload_immediate_work_queue_if_empty(self: &Arc<Self>) {
        if let Some(outcome) = self.refill_immediate_from_incoming() {
            self.propagate_push_outcome(WorkQueueKind::Immediate, outcome);
        }
    }

    /// Moves the immediate incoming buffer into the immediate `WorkQueue`
    /// if the latter is empty, without notifying `WorkQueueSets`. Used by
    /// the pop path, where the caller's own `on_work_queue_popped_min`
    /// notification already accounts for whatever the refill produces —
    /// a separate `became_ready` notification here would register the
    /// queue twice in the same priority heap.
    fn refill_immediate_from_incoming(self: &Arc<Self>) -> Option<PushOutcome> {
        let mut work_queue = self.immediate_work_queue.lock();
        if !work_queue.is_deque_empty() {
            return None;
        }
        let incoming = std::mem::take(&mut *self.immediate_incoming.lock());
        if incoming.is_empty() {
            return None;
        }
        let mut outcome = PushOutcome::NoChange;
        let mut first = true;
        for task in incoming {
            let this_outcome = work_queue.push(task);
            if first {
                outcome = this_outcome;
                first = false;
            }
        }
        Some(outcome)
    }

    pub fn has_task_to_run_immediately(&self) -> bool {
        !self.immediate_work_queue.lock().is_deque_empty() || !self.immediate_incoming.lock().is_empty()
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.immediate_work_queue.lock().len()
            + self.delayed_work_queue.lock().len()
            + self.immediate_incoming.lock().len()
            + self.delayed_incoming.lock().len()
    }

    /// Re-queues a previously deferred non-nestable task to the front of
    /// its original `WorkQueue`, preserving FIFO order among deferred
    /// tasks re-queued in sequence.
    pub(crate) fn requeue_non_nestable_to_front(self: &Arc<Self>, kind: WorkQueueKind, task: Task) {
        let outcome = match kind {
            WorkQueueKind::Immediate => self.immediate_work_queue.lock().push_non_nestable_to_front(task),
            WorkQueueKind::Delayed => self.delayed_work_queue.lock().push_non_nestable_to_front(task),
        };
        self.propagate_front_push_outcome(kind, outcome);
    }

    pub(crate) fn take_front_immediate(self: &Arc<Self>) -> Option<Task> {
        let task = self.immediate_work_queue.lock().take_front();
        if task.is_some() {
            self.refill_immediate_from_incoming();
            if let Some(host) = self.host() {
                host.on_work_queue_popped_min(self, WorkQueueKind::Immediate);
            }
        }
        task
    }

    pub(crate) fn take_front_delayed(self: &Arc<Self>) -> Option<Task> {
        let task = self.delayed_work_queue.lock().take_front();
        if task.is_some() {
            if let Some(host) = self.host() {
                host.on_work_queue_popped_min(self, WorkQueueKind::Delayed);
            }
        }
        task
    }

    pub(crate) fn remove_all_canceled_from_front(self: &Arc<Self>, kind: WorkQueueKind) -> bool {
        let queue = match kind {
            WorkQueueKind::Immediate => &self.immediate_work_queue,
            WorkQueueKind::Delayed => &self.delayed_work_queue,
        };
        let removed = queue.lock().remove_all_canceled_from_front();
        if removed {
            if let Some(order) = queue.lock().front_task_order() {
                if let Some(host) = self.host() {
                    host.on_work_queue_front_changed(self, kind, order);
                }
            }
        }
        removed
    }

    pub(crate) fn front_task_order(&self, kind: WorkQueueKind) -> Option<TaskOrder> {
        match kind {
            WorkQueueKind::Immediate => self.immediate_work_queue.lock().front_task_order(),
            WorkQueueKind::Delayed => self.delayed_work_queue.lock().front_task_order(),
        }
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// A veto-holding handle for a queue's enabled state. Starts "voting
/// enabled"; destruction releases that vote. A queue is enabled iff every
/// outstanding voter currently votes enabled.
pub struct QueueEnabledVoter {
    queue: Arc<TaskQueueState>,
    voted_enabled: bool,
}

impl QueueEnabledVoter {
    pub fn set_voted_enabled(&mut self, enabled: bool) {
        if self.voted_enabled == enabled {
            return;
        }
        self.voted_enabled = enabled;
        let was_enabled = self.queue.is_enabled();
        if enabled {
            self.queue.enabled_ref_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.queue.enabled_ref_count.fetch_sub(1, Ordering::AcqRel);
        }
        let now_enabled = self.queue.is_enabled();
        if was_enabled != now_enabled {
            self.queue.on_enabled_state_changed(now_enabled);
        }
    }
}

impl Drop for QueueEnabledVoter {
    fn drop(&mut self) {
        let was_enabled = self.queue.is_enabled();
        if self.voted_enabled {
            self.queue.enabled_ref_count.fetch_sub(1, Ordering::AcqRel);
        }
        self.queue.voter_ref_count.fetch_sub(1, Ordering::AcqRel);
        let now_enabled = self.queue.is_enabled();
        if was_enabled != now_enabled {
            self.queue.on_enabled_state_changed(now_enabled);
        }
    }
}

/// The public, cloneable handle to a queue. Producers post through this;
/// dropping the last handle off-thread routes the underlying state
/// through the `GracefulQueueShutdownHelper` instead of destroying it
/// synchronously.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) state: Arc<TaskQueueState>,
    shutdown_helper: Weak<crate::graceful_shutdown::GracefulQueueShutdownHelper>,
}

impl TaskQueue {
    pub(crate) fn new(state: Arc<TaskQueueState>, shutdown_helper: Weak<crate::graceful_shutdown::GracefulQueueShutdownHelper>) -> Self {
        Self { state, shutdown_helper }
    }

    pub fn post_task(&self, posted_task: PostedTask) -> Result<()> {
        self.state.post_task(posted_task)
    }

    pub fn set_queue_priority(&self, priority: QueuePriority) {
        self.state.set_queue_priority(priority)
    }

    pub fn queue_priority(&self) -> QueuePriority {
        self.state.priority()
    }

    pub fn insert_fence(&self, position: FencePosition) {
        self.state.insert_fence(position)
    }

    pub fn insert_fence_at(&self, time: TimeTicks) {
        self.state.insert_fence_at(time)
    }

    pub fn remove_fence(&self) {
        self.state.remove_fence()
    }

    pub fn has_active_fence(&self) -> bool {
        self.state.has_active_fence()
    }

    pub fn blocked_by_fence(&self) -> bool {
        self.state.blocked_by_fence()
    }

    pub fn create_queue_enabled_voter(&self) -> QueueEnabledVoter {
        self.state.create_queue_enabled_voter()
    }

    pub fn time_domain(&self) -> Arc<TimeDomain> {
        self.state.time_domain()
    }

    pub fn set_time_domain(&self, time_domain: Arc<TimeDomain>) {
        self.state.set_time_domain(time_domain)
    }

    pub fn sweep_canceled_delayed_tasks(&self) {
        let now = self.state.time_domain().now();
        self.state.sweep_canceled_delayed_tasks(now)
    }

    pub fn has_task_to_run_immediately(&self) -> bool {
        self.state.has_task_to_run_immediately()
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.state.number_of_pending_tasks()
    }

    pub fn shutdown_task_queue(&self) {
        self.state.shutdown();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if Arc::strong_count(&self.state) != 1 {
            return;
        }
        if self.state.associated_thread.is_bound_to_current_thread() || !self.state.associated_thread.is_bound() {
            self.state.shutdown();
            return;
        }
        if let Some(helper) = self.shutdown_helper.upgrade() {
            self.state.shutdown();
            helper.gracefully_shutdown_task_queue(self.state.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::QueuePriority;

    fn new_queue() -> Arc<TaskQueueState> {
        TaskQueueState::new(
            TaskQueueSpec::new("q").with_priority(QueuePriority::Normal),
            AssociatedThreadId::create_bound(),
            Arc::new(EnqueueOrderGenerator::new()),
            Arc::new(TimeDomain::real()),
        )
    }

    #[test]
    fn immediate_post_then_take_preserves_order() {
        let queue = new_queue();
        queue.post_task(PostedTask::new(|| {})).unwrap();
        queue.post_task(PostedTask::new(|| {})).unwrap();
        queue.reload_immediate_work_queue_if_empty();
        let first = queue.take_front_immediate().unwrap();
        let second_front = queue.front_task_order(WorkQueueKind::Immediate);
        assert!(second_front.is_some());
        assert!(first.enqueue_order.is_none() == false);
    }

    #[test]
    fn shutdown_rejects_further_posts() {
        let queue = new_queue();
        queue.shutdown();
        let err = queue.post_task(PostedTask::new(|| {})).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueShutDown { .. }));
    }

    #[test]
    fn voter_veto_disables_and_reenables() {
        let queue = new_queue();
        let mut voter = queue.create_queue_enabled_voter();
        assert!(queue.is_enabled());
        voter.set_voted_enabled(false);
        assert!(!queue.is_enabled());
        voter.set_voted_enabled(true);
        assert!(queue.is_enabled());
    }

    #[test]
    fn beginning_of_time_fence_blocks_existing_task() {
        let queue = new_queue();
        queue.post_task(PostedTask::new(|| {})).unwrap();
        queue.reload_immediate_work_queue_if_empty();
        queue.insert_fence(FencePosition::BeginningOfTime);
        assert!(queue.front_task_order(WorkQueueKind::Immediate).is_none());
        queue.remove_fence();
        assert!(queue.front_task_order(WorkQueueKind::Immediate).is_some());
    }
}
