//! The orchestrator: owns queues, advances time, reloads work, runs the
//! selector, invokes observers, and drives graceful shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::associated_thread::AssociatedThreadId;
use crate::controller::{NullController, SequenceManagerController};
use crate::enqueue_order::{EnqueueOrder, EnqueueOrderGenerator};
use crate::graceful_shutdown::GracefulQueueShutdownHelper;
use crate::observer::{NestingObserver, TaskObserver, TaskTimeObserver};
use crate::selector::{QueuePriority, TaskQueueSelector};
use crate::settings::SchedulerSettings;
use crate::task::{Task, TaskOrder, TaskType};
use crate::task_queue::{TaskQueue, TaskQueueHost, TaskQueueSpec, TaskQueueState};
use crate::time::{Clock, SystemClock, TimeDelta, TimeTicks};
use crate::time_domain::{RealTimeDomainHooks, TimeDomain};
use crate::work_queue::WorkQueueKind;

/// The memory-corruption sentinel's expected value; compared through a
/// function the compiler cannot constant-fold away.
const SENTINEL_VALUE: u32 = 0xdead_beef;

#[inline(never)]
fn sentinel_matches(value: u32) -> bool {
    value == SENTINEL_VALUE
}

struct ExecutionFrame {
    queue: Arc<TaskQueueState>,
    task_type: TaskType,
    start_time: TimeTicks,
}

/// A task selected to run. Holds the callback; invoking `run` executes it.
pub struct PendingTask {
    task: Task,
    queue: Arc<TaskQueueState>,
}

impl PendingTask {
    pub fn task_type(&self) -> TaskType {
        self.task.task_type
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn run(mut self) {
        if let Some(callback) = self.task.callback.take() {
            callback();
        }
    }
}

#[derive(Default)]
struct AnyThreadState {
    incoming_queues: Vec<Arc<TaskQueueState>>,
}

/// State shared between the `SequenceManager` facade and every
/// `TaskQueueState` it owns, via `Weak<dyn TaskQueueHost>` back-references.
struct SequenceManagerShared {
    associated_thread: Arc<AssociatedThreadId>,
    enqueue_order_generator: Arc<EnqueueOrderGenerator>,
    selector: Mutex<TaskQueueSelector>,
    settings: SchedulerSettings,
    time_domains: Mutex<Vec<Arc<TimeDomain>>>,
    default_time_domain: Mutex<Arc<TimeDomain>>,
    // Non-owning: a queue's only strong owner is its public `TaskQueue`
    // handle (plus, transiently, a selector heap entry or the any-thread
    // incoming list). Holding `Arc` here would make `Arc::strong_count`
    // in `TaskQueue::Drop` permanently >= 2 and the graceful-shutdown
    // path in its `Drop` impl unreachable.
    queues: Mutex<Vec<Weak<TaskQueueState>>>,
    queues_to_gracefully_shutdown: Mutex<Vec<Arc<TaskQueueState>>>,
    queues_to_delete: Mutex<Vec<Arc<TaskQueueState>>>,
    any_thread: Mutex<AnyThreadState>,
    shutdown_helper: Arc<GracefulQueueShutdownHelper>,
    controller: Arc<dyn SequenceManagerController>,

    task_observers: Mutex<Vec<Arc<dyn TaskObserver>>>,
    task_time_observers: Mutex<Vec<Arc<dyn TaskTimeObserver>>>,
    nesting_observer: Mutex<Option<Arc<dyn NestingObserver>>>,

    execution_stack: Mutex<Vec<ExecutionFrame>>,
    nesting_depth: AtomicU32,
    deferred_non_nestable: Mutex<VecDeque<(Arc<TaskQueueState>, WorkQueueKind, Task)>>,

    sentinel: AtomicU32,
    work_batch_size: AtomicUsize,
    force_thread_time_capture: AtomicBool,
    any_task_ran: AtomicBool,
}

impl TaskQueueHost for SequenceManagerShared {
    fn on_work_queue_became_ready(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, order: TaskOrder) {
        self.selector.lock().sets_mut(kind).on_task_pushed_to_empty_queue(queue, kind, order);
    }

    fn on_work_queue_front_changed(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind, order: TaskOrder) {
        self.selector.lock().sets_mut(kind).on_queues_front_task_changed(queue, kind, order);
    }

    fn on_work_queue_blocked(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind) {
        self.selector.lock().sets_mut(kind).on_queue_blocked(queue, kind);
    }

    fn on_work_queue_popped_min(&self, queue: &Arc<TaskQueueState>, kind: WorkQueueKind) {
        let new_front = queue.front_task_order(kind);
        self.selector.lock().sets_mut(kind).on_pop_min_queue_in_set(queue, kind, new_front);
    }

    fn on_queue_enabled(&self, queue: &Arc<TaskQueueState>) {
        let priority = queue.priority();
        let mut selector = self.selector.lock();
        for kind in [WorkQueueKind::Immediate, WorkQueueKind::Delayed] {
            let front = queue.front_task_order(kind);
            selector.sets_mut(kind).add_queue(queue.clone(), kind, priority, front);
        }
    }

    fn on_queue_disabled(&self, queue: &Arc<TaskQueueState>) {
        let mut selector = self.selector.lock();
        for kind in [WorkQueueKind::Immediate, WorkQueueKind::Delayed] {
            selector.sets_mut(kind).remove_queue(queue, kind);
        }
    }

    fn on_queue_priority_changed(&self, queue: &Arc<TaskQueueState>, new_priority: QueuePriority) {
        let mut selector = self.selector.lock();
        for kind in [WorkQueueKind::Immediate, WorkQueueKind::Delayed] {
            let old_priority = queue.work_queue_set_index(kind);
            selector.sets_mut(kind).change_set_index(queue, kind, old_priority, new_priority);
            queue.set_work_queue_set_index(kind, new_priority);
        }
    }

    fn on_queue_has_incoming_immediate_work(&self, queue: &Arc<TaskQueueState>, order: EnqueueOrder, queue_is_blocked: bool) {
        trace!(queue = %queue.name(), ?order, "on_queue_has_incoming_immediate_work");
        self.any_thread.lock().incoming_queues.push(queue.clone());
        if !queue_is_blocked {
            self.controller.request_do_work();
        }
    }

    fn request_do_work(&self) {
        self.controller.request_do_work();
    }
}

/// The orchestrator. Owns every `TaskQueue` it creates, the selector, the
/// registered `TimeDomain`s, and the host controller contract.
pub struct SequenceManager {
    inner: Arc<SequenceManagerShared>,
}

impl SequenceManager {
    /// Construct bound to the current thread, using a real monotonic
    /// clock and `controller` for do-work requests.
    pub fn new_bound(controller: Arc<dyn SequenceManagerController>, settings: SchedulerSettings) -> Self {
        let manager = Self::new_unbound(controller, settings);
        manager.bind_to_current_thread();
        manager.complete_initialization_on_bound_thread();
        manager
    }

    /// Construct without binding to a thread yet, so the manager can be
    /// created on one thread and run on another.
    pub fn new_unbound(controller: Arc<dyn SequenceManagerController>, settings: SchedulerSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let real_time_domain = Arc::new(TimeDomain::new(Arc::new(RealTimeDomainHooks::new(clock, controller.clone()))));

        let inner = Arc::new(SequenceManagerShared {
            associated_thread: AssociatedThreadId::create_unbound(),
            enqueue_order_generator: Arc::new(EnqueueOrderGenerator::new()),
            selector: Mutex::new(TaskQueueSelector::new(settings)),
            settings,
            time_domains: Mutex::new(vec![real_time_domain.clone()]),
            default_time_domain: Mutex::new(real_time_domain),
            queues: Mutex::new(Vec::new()),
            queues_to_gracefully_shutdown: Mutex::new(Vec::new()),
            queues_to_delete: Mutex::new(Vec::new()),
            any_thread: Mutex::new(AnyThreadState::default()),
            shutdown_helper: Arc::new(GracefulQueueShutdownHelper::new()),
            controller,
            task_observers: Mutex::new(Vec::new()),
            task_time_observers: Mutex::new(Vec::new()),
            nesting_observer: Mutex::new(None),
            execution_stack: Mutex::new(Vec::new()),
            nesting_depth: AtomicU32::new(0),
            deferred_non_nestable: Mutex::new(VecDeque::new()),
            sentinel: AtomicU32::new(SENTINEL_VALUE),
            work_batch_size: AtomicUsize::new(1),
            force_thread_time_capture: AtomicBool::new(false),
            any_task_ran: AtomicBool::new(false),
        });

        info!("SequenceManager created");
        Self { inner }
    }

    pub fn bind_to_current_thread(&self) {
        self.inner.associated_thread.bind_to_current_thread();
    }

    pub fn complete_initialization_on_bound_thread(&self) {
        // The nesting observer, if any, is registered by the embedder via
        // `set_nesting_observer`; nothing else is deferred past binding.
    }

    pub fn create_task_queue(&self, spec: TaskQueueSpec) -> TaskQueue {
        self.inner.associated_thread.check_on_associated_thread();
        let time_domain = self.inner.default_time_domain.lock().clone();
        let state = TaskQueueState::new(spec, self.inner.associated_thread.clone(), self.inner.enqueue_order_generator.clone(), time_domain);

        let host: Weak<dyn TaskQueueHost> = Arc::downgrade(&self.inner);
        state.bind_host(host);

        // A freshly constructed queue has an equal (zero) enabled/voter
        // ref-count, so it starts enabled with no voter needed; register
        // it with the selector directly.
        self.inner.queues.lock().push(Arc::downgrade(&state));
        self.inner.on_queue_enabled(&state);

        debug!(queue = %state.name(), "create_task_queue");
        TaskQueue::new(state, Arc::downgrade(&self.inner.shutdown_helper))
    }

    pub fn register_time_domain(&self, time_domain: Arc<TimeDomain>) {
        self.inner.time_domains.lock().push(time_domain);
    }

    pub fn unregister_time_domain(&self, time_domain: &Arc<TimeDomain>) {
        self.inner.time_domains.lock().retain(|td| !Arc::ptr_eq(td, time_domain));
    }

    /// Registers `time_domain` and makes it the domain newly created
    /// queues use, and the one `delay_till_next_task`/observer timestamps
    /// are measured against. Lets a virtual-clock-driven test replace the
    /// real-time default installed at construction.
    pub fn set_default_time_domain(&self, time_domain: Arc<TimeDomain>) {
        self.register_time_domain(time_domain.clone());
        *self.inner.default_time_domain.lock() = time_domain;
    }

    pub fn set_work_batch_size(&self, n: usize) {
        assert!(n >= 1, "work_batch_size must be >= 1");
        self.inner.work_batch_size.store(n, Ordering::Relaxed);
    }

    /// How many tasks the host controller should pull per do-work pass
    /// before yielding back to its event loop.
    pub fn work_batch_size(&self) -> usize {
        self.inner.work_batch_size.load(Ordering::Relaxed)
    }

    pub fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.inner.task_observers.lock().push(observer);
    }

    pub fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.inner.task_observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn add_task_time_observer(&self, observer: Arc<dyn TaskTimeObserver>) {
        self.inner.task_time_observers.lock().push(observer);
    }

    pub fn remove_task_time_observer(&self, observer: &Arc<dyn TaskTimeObserver>) {
        self.inner.task_time_observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn set_nesting_observer(&self, observer: Arc<dyn NestingObserver>) {
        *self.inner.nesting_observer.lock() = Some(observer);
    }

    pub fn on_begin_nested_run_loop(&self) {
        self.inner.nesting_depth.fetch_add(1, Ordering::AcqRel);
        if let Some(observer) = self.inner.nesting_observer.lock().as_ref() {
            observer.on_begin_nested_run_loop();
        }
    }

    pub fn on_exit_nested_run_loop(&self) {
        let depth = self.inner.nesting_depth.fetch_sub(1, Ordering::AcqRel) - 1;
        if let Some(observer) = self.inner.nesting_observer.lock().as_ref() {
            observer.on_exit_nested_run_loop();
        }
        if depth == 0 {
            self.requeue_deferred_non_nestable_tasks();
        }
    }

    fn requeue_deferred_non_nestable_tasks(&self) {
        let mut deferred = std::mem::take(&mut *self.inner.deferred_non_nestable.lock());
        // Each `push_front` reverses whatever order it's fed, so drain
        // back-to-front to land back in original FIFO order.
        while let Some((queue, kind, task)) = deferred.pop_back() {
            queue.requeue_non_nestable_to_front(kind, task);
        }
    }

    fn now(&self) -> TimeTicks {
        self.inner.default_time_domain.lock().now()
    }

    /// Returns the next task to run, or `None` if nothing is ready.
    pub fn take_task(&self) -> Option<PendingTask> {
        self.inner.associated_thread.check_on_associated_thread();

        if !sentinel_matches(self.inner.sentinel.load(Ordering::Acquire)) {
            tracing::error!("sequence manager memory corruption sentinel mismatch");
            std::process::abort();
        }

        let incoming_queues = std::mem::take(&mut self.inner.any_thread.lock().incoming_queues);
        for queue in &incoming_queues {
            queue.reload_immediate_work_queue_if_empty();
        }

        for time_domain in self.inner.time_domains.lock().iter() {
            let now = time_domain.now();
            let ready = time_domain.move_ready_delayed_tasks_to_work_queues(now);
            for queue in ready {
                queue.wake_up_for_delayed_work(now);
            }
        }

        loop {
            let (queue, kind) = self.inner.selector.lock().select_work_queue_to_service()?;

            if queue.remove_all_canceled_from_front(kind) {
                continue;
            }

            let task = match kind {
                WorkQueueKind::Immediate => queue.take_front_immediate(),
                WorkQueueKind::Delayed => queue.take_front_delayed(),
            };
            let Some(task) = task else { continue };

            if task.nestable == crate::task::Nestable::NonNestable && self.inner.nesting_depth.load(Ordering::Acquire) > 0 {
                self.inner.deferred_non_nestable.lock().push_back((queue, kind, task));
                continue;
            }

            let task_type = task.task_type;
            let start_time = self.now();
            self.inner.execution_stack.lock().push(ExecutionFrame { queue: queue.clone(), task_type, start_time });

            for observer in self.inner.task_observers.lock().iter() {
                observer.will_process_task(task_type);
            }
            if self.inner.nesting_depth.load(Ordering::Acquire) == 0 {
                for observer in self.inner.task_time_observers.lock().iter() {
                    observer.will_process_task(start_time);
                }
            }

            self.inner.any_task_ran.store(true, Ordering::Release);
            trace!(queue = %queue.name(), "will_process_task");
            return Some(PendingTask { task, queue });
        }
    }

    /// Must be called exactly once after the `PendingTask` returned from
    /// the matching `take_task` call has run (or been dropped).
    pub fn did_run_task(&self) {
        let now = self.now();
        let frame = self.inner.execution_stack.lock().pop().expect("did_run_task without a matching take_task");

        for observer in self.inner.task_observers.lock().iter() {
            observer.did_process_task(frame.task_type);
        }
        if self.inner.nesting_depth.load(Ordering::Acquire) == 0 {
            for observer in self.inner.task_time_observers.lock().iter() {
                observer.did_process_task(frame.start_time, now);
            }
        }

        let duration = now.saturating_sub(frame.start_time);
        if duration > TimeDelta::from_millis(50) {
            warn!(queue = %frame.queue.name(), micros = duration.as_micros(), "task ran longer than 50ms");
        }

        if self.inner.nesting_depth.load(Ordering::Acquire) == 0 {
            self.clean_up_queues();
        }
    }

    fn clean_up_queues(&self) {
        let shut_down = self.inner.shutdown_helper.take_queues();
        self.inner.queues_to_gracefully_shutdown.lock().extend(shut_down);

        let mut still_shutting_down = Vec::new();
        for queue in std::mem::take(&mut *self.inner.queues_to_gracefully_shutdown.lock()) {
            if queue.number_of_pending_tasks() == 0 {
                self.unregister_queue(&queue);
                self.inner.queues_to_delete.lock().push(queue);
            } else {
                still_shutting_down.push(queue);
            }
        }
        *self.inner.queues_to_gracefully_shutdown.lock() = still_shutting_down;

        self.inner.queues_to_delete.lock().clear();
    }

    fn unregister_queue(&self, queue: &Arc<TaskQueueState>) {
        let mut selector = self.inner.selector.lock();
        for kind in [WorkQueueKind::Immediate, WorkQueueKind::Delayed] {
            selector.sets_mut(kind).remove_queue(queue, kind);
        }
        drop(selector);
        queue.time_domain().unregister_queue(queue, self.now());
        self.inner.queues.lock().retain(|q| q.upgrade().is_some_and(|q| !Arc::ptr_eq(&q, queue)));
    }

    pub fn delay_till_next_task(&self) -> TimeDelta {
        for queue in self.inner.queues.lock().iter().filter_map(Weak::upgrade) {
            if queue.front_task_order(WorkQueueKind::Immediate).is_some() || queue.front_task_order(WorkQueueKind::Delayed).is_some() {
                return TimeDelta::zero();
            }
            if queue.has_task_to_run_immediately() {
                return TimeDelta::zero();
            }
        }
        self.inner
            .time_domains
            .lock()
            .iter()
            .filter_map(|td| td.delay_till_next_task(td.now()))
            .min()
            .unwrap_or(TimeDelta::from_secs(i64::MAX / 2_000_000))
    }

    pub fn sweep_canceled_delayed_tasks(&self) {
        for queue in self.inner.queues.lock().iter().filter_map(Weak::upgrade) {
            let now = queue.time_domain().now();
            queue.sweep_canceled_delayed_tasks(now);
        }
    }

    pub fn get_and_clear_system_is_quiescent_bit(&self) -> bool {
        !self.inner.any_task_ran.swap(false, Ordering::AcqRel)
    }

    /// Whether this call (probabilistically) should force thread-time
    /// capture for every task in the current batch, per `SchedulerSettings`.
    pub fn should_force_thread_time_capture(&self, sample: f64) -> bool {
        let force = sample < self.inner.settings.thread_sampling_rate;
        self.inner.force_thread_time_capture.store(force, Ordering::Relaxed);
        force
    }

    pub fn should_capture_task_cpu_time(&self, sample: f64) -> bool {
        self.inner.force_thread_time_capture.load(Ordering::Relaxed) || sample < self.inner.settings.task_sampling_rate
    }
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new_bound(Arc::new(NullController), SchedulerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PostedTask;

    #[test]
    fn runs_a_single_immediate_task() {
        let manager = SequenceManager::default();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        queue.post_task(PostedTask::new(move || ran_clone.store(true, Ordering::Release))).unwrap();

        let pending = manager.take_task().expect("a task should be ready");
        pending.run();
        manager.did_run_task();

        assert!(ran.load(Ordering::Acquire));
        assert!(manager.take_task().is_none());
    }

    #[test]
    fn respects_priority_ordering() {
        let manager = SequenceManager::default();
        let q_normal = manager.create_task_queue(TaskQueueSpec::new("normal"));
        let q_high = manager.create_task_queue(TaskQueueSpec::new("high").with_priority(QueuePriority::High));

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        q_normal.post_task(PostedTask::new(move || o1.lock().push("normal"))).unwrap();
        let o2 = order.clone();
        q_high.post_task(PostedTask::new(move || o2.lock().push("high"))).unwrap();

        for _ in 0..2 {
            let pending = manager.take_task().unwrap();
            pending.run();
            manager.did_run_task();
        }

        assert_eq!(*order.lock(), vec!["high", "normal"]);
    }

    #[test]
    fn quiescent_bit_reflects_activity() {
        let manager = SequenceManager::default();
        assert!(manager.get_and_clear_system_is_quiescent_bit());
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        queue.post_task(PostedTask::new(|| {})).unwrap();
        manager.take_task().unwrap().run();
        manager.did_run_task();
        assert!(!manager.get_and_clear_system_is_quiescent_bit());
        assert!(manager.get_and_clear_system_is_quiescent_bit());
    }
}
