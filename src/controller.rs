//! The host message-pump contract. Integration with an actual OS event
//! loop is out of scope (§1); only the hook points the core needs are
//! specified here.

use crate::time::TimeDelta;

/// What the `SequenceManager` expects from its host thread controller:
/// a way to ask for another do-work pass, now or after a delay.
pub trait SequenceManagerController: Send + Sync {
    /// Run `take_task`/`did_run_task` again as soon as the host's event
    /// loop is next idle.
    fn request_do_work(&self);

    /// Run another do-work pass no earlier than `delay` from now.
    /// Repeated calls with a smaller delay should supersede prior ones;
    /// the host is expected to coalesce to a single pending timer.
    fn schedule_delayed_do_work(&self, delay: TimeDelta);
}

/// A controller that drops every request. Useful for tests that drive
/// `take_task`/`did_run_task` manually instead of through a host loop.
#[derive(Debug, Default)]
pub struct NullController;

impl SequenceManagerController for NullController {
    fn request_do_work(&self) {}
    fn schedule_delayed_do_work(&self, _delay: TimeDelta) {}
}
