//! A single-threaded, priority-driven task scheduler for a process-wide
//! event loop.
//!
//! A [`SequenceManager`] owns any number of [`TaskQueue`]s. Producers post
//! [`PostedTask`]s onto a queue from any thread; the bound main thread
//! calls [`SequenceManager::take_task`] / [`SequenceManager::did_run_task`]
//! in a loop, driven by a host [`SequenceManagerController`]. Selection
//! between queues is priority-ordered with anti-starvation accounting, so
//! a `Low`-priority queue eventually runs even under sustained `Normal`
//! load; `TaskQueue::insert_fence` lets a queue temporarily gate its own
//! execution window.
//!
//! Time is abstracted behind [`TimeDomain`], so a virtual clock can drive
//! deterministic tests without a real timer.

pub mod associated_thread;
pub mod controller;
pub mod enqueue_order;
pub mod error;
pub mod fence;
pub mod graceful_shutdown;
pub mod intrusive_heap;
pub mod observer;
pub mod selector;
pub mod sequence_manager;
pub mod settings;
pub mod task;
pub mod task_queue;
pub mod time;
pub mod time_domain;
pub mod work_queue;
pub mod work_queue_sets;

pub use controller::{NullController, SequenceManagerController};
pub use error::{Result, SchedulerError};
pub use observer::{NestingObserver, TaskObserver, TaskTimeObserver};
pub use selector::QueuePriority;
pub use sequence_manager::{PendingTask, SequenceManager};
pub use settings::{SchedulerSettings, StarvationEffect, StarvationIncrements};
pub use task::{CancelHandle, Nestable, PostedTask, TaskType};
pub use task_queue::{FencePosition, QueueEnabledVoter, TaskQueue, TaskQueueSpec};
pub use time::{Clock, SystemClock, TimeDelta, TimeTicks, VirtualClock};
pub use time_domain::{NonWakingTimeDomainHooks, TimeDomain, TimeDomainHooks, VirtualTimeDomainHooks};
