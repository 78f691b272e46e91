//! Tunable constants for the scheduler.
//!
//! The starvation thresholds and CPU-sampling rates below match the
//! source this engine's selection algorithm is distilled from, but they
//! are plain fields rather than hardcoded constants: Open Question (2)
//! asks for them to remain tunable even though nothing in this crate's
//! public surface exposes them to end users yet.

/// How a selection at one priority affects another priority's starvation
/// score: bump it by a fixed amount, reset it to zero (the serviced
/// priority no longer counts as starved), or leave it alone entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarvationEffect {
    Increment(u32),
    Reset,
    NoChange,
}

/// Starvation-score effects applied to (low, normal, high) when a given
/// priority is selected, per the table in §4.6.
#[derive(Debug, Clone, Copy)]
pub struct StarvationIncrements {
    pub low: StarvationEffect,
    pub normal: StarvationEffect,
    pub high: StarvationEffect,
}

impl StarvationIncrements {
    const fn reset_all() -> Self {
        Self { low: StarvationEffect::Reset, normal: StarvationEffect::Reset, high: StarvationEffect::Reset }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Hint to the host controller for how many tasks to run per do-work
    /// call. Must be >= 1.
    pub work_batch_size: usize,

    /// Low-priority starvation score at or above which low-priority work
    /// is serviced unconditionally.
    pub low_priority_starvation_threshold: u32,
    /// Normal-priority starvation score at or above which normal-priority
    /// work is serviced unconditionally.
    pub normal_priority_starvation_threshold: u32,
    /// High-priority starvation score at or above which high-priority
    /// work is serviced unconditionally.
    pub high_priority_starvation_threshold: u32,
    /// Number of consecutive delayed-over-immediate selections at which
    /// immediate work is serviced unconditionally.
    pub immediate_starvation_threshold: u32,

    /// Starvation-increment table, indexed by selected priority:
    /// highest, high, normal, low/best-effort.
    pub increments_for_highest: StarvationIncrements,
    pub increments_for_high: StarvationIncrements,
    pub increments_for_normal: StarvationIncrements,
    pub increments_for_low_or_best_effort: StarvationIncrements,

    /// Probability in [0, 1] of forcing thread-time capture for every
    /// task in a given do-work batch.
    pub thread_sampling_rate: f64,
    /// Probability in [0, 1] of capturing per-task CPU time when thread
    /// sampling did not already force it.
    pub task_sampling_rate: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            work_batch_size: 1,
            low_priority_starvation_threshold: 25,
            normal_priority_starvation_threshold: 5,
            high_priority_starvation_threshold: 3,
            immediate_starvation_threshold: 3,
            increments_for_highest: StarvationIncrements {
                low: StarvationEffect::Increment(1),
                normal: StarvationEffect::Increment(1),
                high: StarvationEffect::Increment(1),
            },
            increments_for_high: StarvationIncrements {
                low: StarvationEffect::Increment(5),
                normal: StarvationEffect::Increment(2),
                high: StarvationEffect::Reset,
            },
            increments_for_normal: StarvationIncrements {
                low: StarvationEffect::Increment(5),
                normal: StarvationEffect::Reset,
                high: StarvationEffect::NoChange,
            },
            increments_for_low_or_best_effort: StarvationIncrements::reset_all(),
            thread_sampling_rate: 1e-4,
            task_sampling_rate: 1e-2,
        }
    }
}
