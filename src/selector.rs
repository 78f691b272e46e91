//! Priority levels and the anti-starvation selection algorithm.

use std::sync::Arc;

use crate::settings::{SchedulerSettings, StarvationEffect};
use crate::task_queue::TaskQueueState;
use crate::work_queue::WorkQueueKind;
use crate::work_queue_sets::WorkQueueSets;

/// Fixed priority levels, ordered from most to least urgent. `Control`
/// bypasses starvation accounting entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QueuePriority {
    Control = 0,
    Highest = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    BestEffort = 5,
}

pub(crate) const QUEUE_PRIORITY_COUNT: usize = 6;

pub(crate) const ALL_PRIORITIES: [QueuePriority; QUEUE_PRIORITY_COUNT] = [
    QueuePriority::Control,
    QueuePriority::Highest,
    QueuePriority::High,
    QueuePriority::Normal,
    QueuePriority::Low,
    QueuePriority::BestEffort,
];

impl QueuePriority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Normal
    }
}

/// Holds the immediate and delayed `WorkQueueSets` and the anti-
/// starvation bookkeeping used to pick the next queue to service.
pub(crate) struct TaskQueueSelector {
    immediate_sets: WorkQueueSets,
    delayed_sets: WorkQueueSets,
    immediate_starvation_count: u32,
    high_priority_starvation_score: u32,
    normal_priority_starvation_score: u32,
    low_priority_starvation_score: u32,
    settings: SchedulerSettings,
}

/// What was picked, and whether it came from the delayed set (used for
/// starvation bookkeeping).
struct Choice {
    queue: Arc<TaskQueueState>,
    kind: WorkQueueKind,
    priority: QueuePriority,
    chose_delayed_over_immediate: bool,
}

impl TaskQueueSelector {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            immediate_sets: WorkQueueSets::new(),
            delayed_sets: WorkQueueSets::new(),
            immediate_starvation_count: 0,
            high_priority_starvation_score: 0,
            normal_priority_starvation_score: 0,
            low_priority_starvation_score: 0,
            settings,
        }
    }

    pub fn immediate_sets_mut(&mut self) -> &mut WorkQueueSets {
        &mut self.immediate_sets
    }

    pub fn delayed_sets_mut(&mut self) -> &mut WorkQueueSets {
        &mut self.delayed_sets
    }

    pub fn sets_mut(&mut self, kind: WorkQueueKind) -> &mut WorkQueueSets {
        match kind {
            WorkQueueKind::Immediate => &mut self.immediate_sets,
            WorkQueueKind::Delayed => &mut self.delayed_sets,
        }
    }

    fn has_work_at(&self, priority: QueuePriority) -> bool {
        !self.immediate_sets.is_set_empty(priority) || !self.delayed_sets.is_set_empty(priority)
    }

    pub fn select_work_queue_to_service(&mut self) -> Option<(Arc<TaskQueueState>, WorkQueueKind)> {
        if self.has_work_at(QueuePriority::Control) {
            let choice = self.choose_with_priority(QueuePriority::Control)?;
            self.apply_bookkeeping(&choice);
            return Some((choice.queue, choice.kind));
        }

        let priority = self.priority_to_service()?;
        let choice = self.choose_with_priority(priority)?;
        self.apply_bookkeeping(&choice);
        Some((choice.queue, choice.kind))
    }

    fn priority_to_service(&self) -> Option<QueuePriority> {
        if self.low_priority_starvation_score >= self.settings.low_priority_starvation_threshold
            && self.has_work_at(QueuePriority::Low)
        {
            return Some(QueuePriority::Low);
        }
        if self.normal_priority_starvation_score >= self.settings.normal_priority_starvation_threshold
            && self.has_work_at(QueuePriority::Normal)
        {
            return Some(QueuePriority::Normal);
        }
        if self.high_priority_starvation_score >= self.settings.high_priority_starvation_threshold
            && self.has_work_at(QueuePriority::High)
        {
            return Some(QueuePriority::High);
        }
        ALL_PRIORITIES.into_iter().find(|&p| self.has_work_at(p))
    }

    fn choose_with_priority(&self, priority: QueuePriority) -> Option<Choice> {
        let immediate = self.immediate_sets.get_oldest_queue_and_task_order(priority);
        let delayed = self.delayed_sets.get_oldest_queue_and_task_order(priority);

        let pick_immediate = |queue: Arc<TaskQueueState>| Choice {
            queue,
            kind: WorkQueueKind::Immediate,
            priority,
            chose_delayed_over_immediate: false,
        };
        let pick_delayed = |queue: Arc<TaskQueueState>, chose_delayed_over_immediate| Choice {
            queue,
            kind: WorkQueueKind::Delayed,
            priority,
            chose_delayed_over_immediate,
        };

        match (immediate, delayed) {
            (Some((iq, _)), _) if self.immediate_starvation_count >= self.settings.immediate_starvation_threshold => {
                Some(pick_immediate(iq))
            }
            (Some((iq, i_order)), Some((dq, d_order))) => {
                if i_order.enqueue_order() < d_order.enqueue_order() {
                    Some(pick_immediate(iq))
                } else {
                    Some(pick_delayed(dq, true))
                }
            }
            (Some((iq, _)), None) => Some(pick_immediate(iq)),
            // No immediate work exists at all, so this isn't the delayed
            // queue winning a race against immediate work — it falls
            // through to "whichever exists" and must not count toward
            // immediate starvation.
            (None, Some((dq, _))) => Some(pick_delayed(dq, false)),
            (None, None) => None,
        }
    }

    fn apply_bookkeeping(&mut self, choice: &Choice) {
        if choice.priority == QueuePriority::Control {
            return;
        }

        if choice.chose_delayed_over_immediate {
            self.immediate_starvation_count += 1;
        } else {
            self.immediate_starvation_count = 0;
        }

        let increments = match choice.priority {
            QueuePriority::Control => return,
            QueuePriority::Highest => &self.settings.increments_for_highest,
            QueuePriority::High => &self.settings.increments_for_high,
            QueuePriority::Normal => &self.settings.increments_for_normal,
            QueuePriority::Low | QueuePriority::BestEffort => &self.settings.increments_for_low_or_best_effort,
        };

        apply_effect(&mut self.low_priority_starvation_score, increments.low, self.has_work_at(QueuePriority::Low));
        apply_effect(
            &mut self.normal_priority_starvation_score,
            increments.normal,
            self.has_work_at(QueuePriority::Normal),
        );
        apply_effect(&mut self.high_priority_starvation_score, increments.high, self.has_work_at(QueuePriority::High));
    }
}

fn apply_effect(score: &mut u32, effect: StarvationEffect, lower_priority_has_work: bool) {
    match effect {
        StarvationEffect::NoChange => {}
        StarvationEffect::Reset => *score = 0,
        StarvationEffect::Increment(amount) => {
            if lower_priority_has_work {
                *score += amount;
            }
        }
    }
}
