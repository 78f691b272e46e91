//! Property-based tests for the invariants the rest of the test suite
//! only spot-checks: heap ordering under random mutation, the task
//! ordering key's total-order guarantee, enqueue order monotonicity, and
//! a handful of round-trip/idempotence properties of the public
//! scheduler API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use sequent::enqueue_order::{EnqueueOrder, EnqueueOrderGenerator};
use sequent::intrusive_heap::{HeapHandle, HeapItem, IntrusiveHeap};
use sequent::task::TaskOrder;
use sequent::{
    FencePosition, NonWakingTimeDomainHooks, PostedTask, SequenceManager, TaskQueueSpec, TimeDelta, TimeDomain, TimeTicks, VirtualClock,
};

/// A manager whose default time domain is a virtual, never-advancing
/// clock, so timing-sensitive properties don't race real wall-clock time.
fn manager_with_frozen_clock() -> SequenceManager {
    let manager = SequenceManager::default();
    let clock = Arc::new(VirtualClock::new());
    let domain = Arc::new(TimeDomain::new(Arc::new(NonWakingTimeDomainHooks::new(clock))));
    manager.set_default_time_domain(domain);
    manager
}

// ═══════════════════════════════════════════════════════════════════════
//  IntrusiveHeap
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Entry {
    key: i64,
    handle: Option<HeapHandle>,
}

impl Entry {
    fn new(key: i64) -> Self {
        Self { key, handle: None }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.key.partial_cmp(&other.key)
    }
}

impl HeapItem for Entry {
    fn set_heap_handle(&mut self, handle: HeapHandle) {
        self.handle = Some(handle);
    }
    fn clear_heap_handle(&mut self) {
        self.handle = None;
    }
}

#[derive(Debug, Clone)]
enum HeapOp {
    Insert(i64),
    PopMin,
}

fn heap_op() -> impl Strategy<Value = HeapOp> {
    prop_oneof![any::<i64>().prop_map(HeapOp::Insert), Just(HeapOp::PopMin)]
}

proptest! {
    /// A random mix of inserts and pop-mins must always report the same
    /// minimum and count as a sorted shadow multiset, and draining both
    /// to empty must produce the same sorted sequence.
    #[test]
    fn heap_min_and_len_track_a_shadow_multiset(ops in prop::collection::vec(heap_op(), 0..200)) {
        let mut heap: IntrusiveHeap<Entry> = IntrusiveHeap::new();
        let mut shadow: Vec<i64> = Vec::new();

        for op in ops {
            match op {
                HeapOp::Insert(key) => {
                    heap.insert(Entry::new(key));
                    shadow.push(key);
                }
                HeapOp::PopMin => {
                    if let Some(min) = shadow.iter().min().copied() {
                        let pos = shadow.iter().position(|&k| k == min).unwrap();
                        shadow.remove(pos);
                        heap.pop();
                    }
                }
            }
            prop_assert_eq!(heap.len(), shadow.len());
            prop_assert_eq!(heap.is_empty(), shadow.is_empty());
            prop_assert_eq!(heap.min().map(|e| e.key), shadow.iter().min().copied());
        }

        shadow.sort();
        let mut drained = Vec::new();
        while let Some(e) = heap.min() {
            drained.push(e.key);
            heap.pop();
        }
        prop_assert_eq!(drained, shadow);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  EnqueueOrder / TaskOrder
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    /// `next()` never repeats and never goes backwards, no matter how
    /// many times it's called.
    #[test]
    fn enqueue_order_generator_is_strictly_increasing(count in 1usize..500) {
        let generator = EnqueueOrderGenerator::new();
        let mut previous = None;
        for _ in 0..count {
            let order = generator.next();
            prop_assert!(order > EnqueueOrder::blocking_fence());
            if let Some(previous) = previous {
                prop_assert!(order > previous);
            }
            previous = Some(order);
        }
    }

    /// At equal `enqueue_order`, ties break on `delayed_run_time`.
    #[test]
    fn task_order_ties_break_on_delayed_run_time(a_micros in any::<i64>(), b_micros in any::<i64>()) {
        let generator = EnqueueOrderGenerator::new();
        let order = generator.next();
        let a = TaskOrder::new(order, TimeTicks::from_micros(a_micros), 0);
        let b = TaskOrder::new(order, TimeTicks::from_micros(b_micros), 0);
        prop_assert_eq!(a.cmp(&b), a_micros.cmp(&b_micros));
    }

    /// At equal `enqueue_order` and `delayed_run_time`, ties break on
    /// `sequence_num` with wraparound-tolerant signed comparison.
    #[test]
    fn task_order_ties_break_on_sequence_num_with_wraparound(seq in any::<i32>(), delta in 1i32..=i32::MAX) {
        let generator = EnqueueOrderGenerator::new();
        let order = generator.next();
        let a = TaskOrder::new(order, TimeTicks::zero(), seq);
        let b = TaskOrder::new(order, TimeTicks::zero(), seq.wrapping_add(delta));
        let expected_less = seq.wrapping_sub(seq.wrapping_add(delta)) < 0;
        prop_assert_eq!(a < b, expected_less);
    }

    /// `TaskOrder`'s `Ord` impl is a genuine total order: antisymmetric
    /// and transitive over a random triple built from real, possibly
    /// colliding, enqueue orders.
    #[test]
    fn task_order_is_a_strict_total_order(
        picks in prop::collection::vec((0usize..4, any::<i64>(), any::<i32>()), 3),
    ) {
        let generator = EnqueueOrderGenerator::new();
        let orders: Vec<EnqueueOrder> = (0..4).map(|_| generator.next()).collect();
        let built: Vec<TaskOrder> = picks
            .iter()
            .map(|&(idx, micros, seq)| TaskOrder::new(orders[idx], TimeTicks::from_micros(micros), seq))
            .collect();

        for a in &built {
            for b in &built {
                let ab = a.cmp(b);
                let ba = b.cmp(a);
                prop_assert_eq!(ab, ba.reverse());
            }
        }

        let (a, b, c) = (built[0], built[1], built[2]);
        if a <= b && b <= c {
            prop_assert!(a <= c);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SequenceManager round trips
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    /// Tasks posted to one queue, one priority, always run in post order,
    /// no matter how many are queued up.
    #[test]
    fn single_queue_preserves_post_order(count in 1usize..64) {
        let manager = SequenceManager::default();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..count {
            let order = order.clone();
            queue.post_task(PostedTask::new(move || order.lock().unwrap().push(i))).unwrap();
        }
        for _ in 0..count {
            let pending = manager.take_task().unwrap();
            pending.run();
            manager.did_run_task();
        }

        prop_assert_eq!(&*order.lock().unwrap(), &(0..count).collect::<Vec<_>>());
        prop_assert!(manager.take_task().is_none());
    }

    /// Inserting then removing a `Now` fence never loses or duplicates a
    /// task, whether it was posted before or after the fence went up.
    #[test]
    fn fence_round_trip_preserves_every_task(before in 0usize..8, after in 0usize..8) {
        let manager = SequenceManager::default();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        let ran = Arc::new(Mutex::new(Vec::new()));

        for i in 0..before {
            let ran = ran.clone();
            queue.post_task(PostedTask::new(move || ran.lock().unwrap().push(i))).unwrap();
        }
        queue.insert_fence(FencePosition::Now);
        for i in before..before + after {
            let ran = ran.clone();
            queue.post_task(PostedTask::new(move || ran.lock().unwrap().push(i))).unwrap();
        }

        prop_assert!(manager.take_task().is_none(), "every task sits behind the fence until it's removed");

        queue.remove_fence();
        while let Some(pending) = manager.take_task() {
            pending.run();
            manager.did_run_task();
        }

        let mut seen = ran.lock().unwrap().clone();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..before + after).collect::<Vec<_>>());
    }

    /// Toggling a queue's enabled-voter off and back on any number of
    /// times ends up exactly where an untouched voter would: the queue
    /// still runs its one pending task exactly once.
    #[test]
    fn enable_disable_round_trip_is_idempotent(toggles in 0usize..10) {
        let manager = SequenceManager::default();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        queue.post_task(PostedTask::new(move || { ran_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();

        let mut voter = queue.create_queue_enabled_voter();
        for i in 0..toggles {
            voter.set_voted_enabled(i % 2 == 1);
        }
        voter.set_voted_enabled(true);

        let mut completed = 0;
        while let Some(pending) = manager.take_task() {
            pending.run();
            manager.did_run_task();
            completed += 1;
        }

        prop_assert_eq!(completed, 1);
        prop_assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    /// Sweeping canceled delayed tasks with nothing new to cancel since
    /// the last sweep is a no-op: the next scheduled wake-up is unchanged.
    #[test]
    fn repeated_sweep_with_no_new_cancellations_is_a_no_op(delay_ms in 1i64..1000) {
        let manager = manager_with_frozen_clock();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        queue.post_task(PostedTask::new(|| {}).with_delay(TimeDelta::from_millis(delay_ms))).unwrap();

        queue.sweep_canceled_delayed_tasks();
        let first = manager.delay_till_next_task();
        queue.sweep_canceled_delayed_tasks();
        let second = manager.delay_till_next_task();

        prop_assert_eq!(first, second);
    }

    /// A task posted with no delay behaves identically to one posted with
    /// an explicit zero delay: both are immediately selectable without
    /// any clock movement.
    #[test]
    fn zero_delay_post_is_equivalent_to_omitting_delay(explicit_zero in any::<bool>()) {
        let manager = SequenceManager::default();
        let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        let task = PostedTask::new(move || { ran_clone.fetch_add(1, Ordering::SeqCst); });
        let task = if explicit_zero { task.with_delay(TimeDelta::zero()) } else { task };
        queue.post_task(task).unwrap();

        let pending = manager.take_task().expect("zero-delay work is immediately selectable");
        pending.run();
        manager.did_run_task();

        prop_assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
