//! Per-queue wake-up aggregation: one heap per `TimeDomain` tracking the
//! earliest pending delayed task across every queue that uses it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::intrusive_heap::{HeapHandle, HeapItem, IntrusiveHeap};
use crate::task::{DelayedWakeUp, Resolution};
use crate::task_queue::TaskQueueState;
use crate::time::{Clock, SystemClock, TimeDelta, TimeTicks, VirtualClock};

/// The part of a `TimeDomain` that varies by clock source and by how
/// (or whether) a changed next-wake-up is surfaced to a host controller.
pub trait TimeDomainHooks: Send + Sync {
    fn now(&self) -> TimeTicks;

    /// Called whenever the heap's min changes. `next = None` means no
    /// queue using this domain currently has a pending wake-up.
    fn on_next_wake_up_changed(&self, now: TimeTicks, next: Option<TimeTicks>);

    fn name(&self) -> &str;
}

struct WakeUpEntry {
    wake_up: DelayedWakeUp,
    queue: Arc<TaskQueueState>,
    heap_handle: Option<HeapHandle>,
}

impl PartialEq for WakeUpEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_up == other.wake_up
    }
}

impl PartialOrd for WakeUpEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.wake_up.partial_cmp(&other.wake_up)
    }
}

impl HeapItem for WakeUpEntry {
    fn set_heap_handle(&mut self, handle: HeapHandle) {
        self.heap_handle = Some(handle);
        self.queue.set_wake_up_heap_handle(Some(handle));
    }

    fn clear_heap_handle(&mut self) {
        self.heap_handle = None;
        self.queue.set_wake_up_heap_handle(None);
    }
}

/// Aggregates per-queue `DelayedWakeUp`s into one scheduled wake-up. At
/// most one heap entry per queue at a time.
pub struct TimeDomain {
    heap: Mutex<IntrusiveHeap<WakeUpEntry>>,
    pending_high_res_count: AtomicI32,
    hooks: Arc<dyn TimeDomainHooks>,
}

impl TimeDomain {
    pub fn new(hooks: Arc<dyn TimeDomainHooks>) -> Self {
        Self { heap: Mutex::new(IntrusiveHeap::new()), pending_high_res_count: AtomicI32::new(0), hooks }
    }

    pub fn real() -> Self {
        Self::new(Arc::new(RealTimeDomainHooks::new(Arc::new(SystemClock::new()), Arc::new(crate::controller::NullController))))
    }

    pub fn name(&self) -> &str {
        self.hooks.name()
    }

    pub fn now(&self) -> TimeTicks {
        self.hooks.now()
    }

    pub fn delay_till_next_task(&self, now: TimeTicks) -> Option<TimeDelta> {
        let heap = self.heap.lock();
        let earliest = heap.min()?.wake_up.time;
        if earliest <= now {
            Some(TimeDelta::zero())
        } else {
            Some(earliest.saturating_sub(now))
        }
    }

    /// Insert, re-key, or erase `queue`'s entry. `None` cancels any
    /// pending wake-up for the queue. Fires `on_next_wake_up_changed`
    /// only when the heap's min actually changes.
    pub fn set_next_wake_up_for_queue(&self, queue: &Arc<TaskQueueState>, wake_up: Option<DelayedWakeUp>, now: TimeTicks) {
        let mut heap = self.heap.lock();
        let before = heap.min().map(|e| e.wake_up.time);
        let existing_handle = queue.wake_up_heap_handle();

        match (existing_handle, wake_up) {
            (None, None) => return,
            (Some(handle), None) => {
                if self.was_high_res(&heap, handle) {
                    self.pending_high_res_count.fetch_sub(1, Ordering::Relaxed);
                }
                heap.erase(handle);
            }
            (None, Some(wake_up)) => {
                if wake_up.resolution == Resolution::High {
                    self.pending_high_res_count.fetch_add(1, Ordering::Relaxed);
                }
                heap.insert(WakeUpEntry { wake_up, queue: queue.clone(), heap_handle: None });
            }
            (Some(handle), Some(wake_up)) => {
                let was_high_res = self.was_high_res(&heap, handle);
                match (was_high_res, wake_up.resolution == Resolution::High) {
                    (true, false) => {
                        self.pending_high_res_count.fetch_sub(1, Ordering::Relaxed);
                    }
                    (false, true) => {
                        self.pending_high_res_count.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                heap.change_key(handle, WakeUpEntry { wake_up, queue: queue.clone(), heap_handle: None });
            }
        }

        let after = heap.min().map(|e| e.wake_up.time);
        drop(heap);
        if before != after {
            self.hooks.on_next_wake_up_changed(now, after);
        }
    }

    fn was_high_res(&self, heap: &IntrusiveHeap<WakeUpEntry>, handle: HeapHandle) -> bool {
        heap.get(handle).wake_up.resolution == Resolution::High
    }

    pub fn unregister_queue(&self, queue: &Arc<TaskQueueState>, now: TimeTicks) {
        self.set_next_wake_up_for_queue(queue, None, now);
    }

    /// Drain every entry whose wake-up time has passed. Returns the
    /// affected queues; the caller runs each queue's own wake-up
    /// handling (which may re-insert into this domain) after the lock
    /// here has been released, avoiding lock re-entry.
    pub fn move_ready_delayed_tasks_to_work_queues(&self, now: TimeTicks) -> Vec<Arc<TaskQueueState>> {
        let mut ready = Vec::new();
        let mut heap = self.heap.lock();
        while let Some(entry) = heap.min() {
            if entry.wake_up.time > now {
                break;
            }
            let queue = entry.queue.clone();
            if entry.wake_up.resolution == Resolution::High {
                self.pending_high_res_count.fetch_sub(1, Ordering::Relaxed);
            }
            heap.pop();
            ready.push(queue);
        }
        ready
    }

    pub fn has_pending_high_res_wake_up(&self) -> bool {
        self.pending_high_res_count.load(Ordering::Relaxed) > 0
    }
}

/// Forwards to the real monotonic clock and the host controller.
pub struct RealTimeDomainHooks {
    clock: Arc<dyn Clock>,
    controller: Arc<dyn crate::controller::SequenceManagerController>,
}

impl RealTimeDomainHooks {
    pub fn new(clock: Arc<dyn Clock>, controller: Arc<dyn crate::controller::SequenceManagerController>) -> Self {
        Self { clock, controller }
    }
}

impl TimeDomainHooks for RealTimeDomainHooks {
    fn now(&self) -> TimeTicks {
        self.clock.now()
    }

    fn on_next_wake_up_changed(&self, now: TimeTicks, next: Option<TimeTicks>) {
        match next {
            None => {}
            Some(t) if t <= now => self.controller.request_do_work(),
            Some(t) => self.controller.schedule_delayed_do_work(t.saturating_sub(now)),
        }
    }

    fn name(&self) -> &str {
        "real_time_domain"
    }
}

/// Ignores wake-up changes entirely; used for virtual time domains where
/// the host steps the clock explicitly instead of waiting on a timer.
pub struct NonWakingTimeDomainHooks {
    clock: Arc<VirtualClock>,
}

impl NonWakingTimeDomainHooks {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self { clock }
    }
}

impl TimeDomainHooks for NonWakingTimeDomainHooks {
    fn now(&self) -> TimeTicks {
        self.clock.now()
    }

    fn on_next_wake_up_changed(&self, _now: TimeTicks, _next: Option<TimeTicks>) {}

    fn name(&self) -> &str {
        "non_waking_time_domain"
    }
}

/// Test mock: virtual-clock backed, records every `on_next_wake_up_changed`
/// call for assertions instead of forwarding anywhere.
pub struct VirtualTimeDomainHooks {
    clock: Arc<VirtualClock>,
    recorded: Mutex<Vec<(TimeTicks, Option<TimeTicks>)>>,
}

impl VirtualTimeDomainHooks {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self { clock, recorded: Mutex::new(Vec::new()) }
    }

    pub fn recorded_changes(&self) -> Vec<(TimeTicks, Option<TimeTicks>)> {
        self.recorded.lock().clone()
    }
}

impl TimeDomainHooks for VirtualTimeDomainHooks {
    fn now(&self) -> TimeTicks {
        self.clock.now()
    }

    fn on_next_wake_up_changed(&self, now: TimeTicks, next: Option<TimeTicks>) {
        self.recorded.lock().push((now, next));
    }

    fn name(&self) -> &str {
        "virtual_time_domain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::associated_thread::AssociatedThreadId;
    use crate::enqueue_order::EnqueueOrderGenerator;
    use crate::selector::QueuePriority;

    fn test_queue(time_domain: Arc<TimeDomain>) -> Arc<TaskQueueState> {
        TaskQueueState::new_detached_for_test(
            "q".to_string(),
            QueuePriority::Normal,
            AssociatedThreadId::create_bound(),
            Arc::new(EnqueueOrderGenerator::new()),
            time_domain,
        )
    }

    #[test]
    fn wake_up_changes_fire_on_new_min() {
        let clock = Arc::new(VirtualClock::new());
        let hooks = Arc::new(VirtualTimeDomainHooks::new(clock.clone()));
        let domain = Arc::new(TimeDomain::new(hooks.clone()));
        let q1 = test_queue(domain.clone());
        let q2 = test_queue(domain.clone());

        domain.set_next_wake_up_for_queue(
            &q1,
            Some(DelayedWakeUp { time: TimeTicks::from_micros(100), resolution: Resolution::Low }),
            TimeTicks::zero(),
        );
        domain.set_next_wake_up_for_queue(
            &q2,
            Some(DelayedWakeUp { time: TimeTicks::from_micros(50), resolution: Resolution::Low }),
            TimeTicks::zero(),
        );

        let changes = hooks.recorded_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].1, Some(TimeTicks::from_micros(50)));
    }

    #[test]
    fn drains_only_entries_at_or_before_now() {
        let clock = Arc::new(VirtualClock::new());
        let hooks = Arc::new(VirtualTimeDomainHooks::new(clock));
        let domain = Arc::new(TimeDomain::new(hooks));
        let q1 = test_queue(domain.clone());
        let q2 = test_queue(domain.clone());

        domain.set_next_wake_up_for_queue(
            &q1,
            Some(DelayedWakeUp { time: TimeTicks::from_micros(10), resolution: Resolution::Low }),
            TimeTicks::zero(),
        );
        domain.set_next_wake_up_for_queue(
            &q2,
            Some(DelayedWakeUp { time: TimeTicks::from_micros(1000), resolution: Resolution::Low }),
            TimeTicks::zero(),
        );

        let ready = domain.move_ready_delayed_tasks_to_work_queues(TimeTicks::from_micros(50));
        assert_eq!(ready.len(), 1);
    }
}
