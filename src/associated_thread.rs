//! Deferred binding of ownership to a thread.

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

/// An optional bound thread id plus an on-thread assertion. Unbound at
/// construction; bound on first use by the owning thread. Rebinding is
/// forbidden, matching the source's `DCHECK_CALLED_ON_VALID_THREAD`
/// contract — enforced here at runtime rather than in the type system,
/// since Rust's ownership rules already rule out the unsafe case (a
/// freed pointer) that a thread checker guards against in C++.
#[derive(Debug, Default)]
pub struct AssociatedThreadId {
    thread_id: Mutex<Option<ThreadId>>,
}

impl AssociatedThreadId {
    pub fn create_unbound() -> Arc<Self> {
        Arc::new(Self { thread_id: Mutex::new(None) })
    }

    pub fn create_bound() -> Arc<Self> {
        let this = Self::create_unbound();
        this.bind_to_current_thread();
        this
    }

    /// Rebind to the current thread. Allows creating the manager and its
    /// queues on a different thread than the one that will run them.
    /// Must only be called once.
    pub fn bind_to_current_thread(&self) {
        let mut guard = self.thread_id.lock();
        assert!(guard.is_none(), "AssociatedThreadId bound more than once");
        *guard = Some(std::thread::current().id());
    }

    pub fn is_bound(&self) -> bool {
        self.thread_id.lock().is_some()
    }

    pub fn is_bound_to_current_thread(&self) -> bool {
        match *self.thread_id.lock() {
            Some(id) => id == std::thread::current().id(),
            None => false,
        }
    }

    /// Panics (in any build) if called from a thread other than the
    /// bound one. A no-op if still unbound.
    pub fn check_on_associated_thread(&self) {
        if let Some(id) = *self.thread_id.lock() {
            assert_eq!(id, std::thread::current().id(), "called off the associated thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_thread_passes_check() {
        let associated = AssociatedThreadId::create_bound();
        associated.check_on_associated_thread();
        assert!(associated.is_bound_to_current_thread());
    }

    #[test]
    #[should_panic(expected = "bound more than once")]
    fn rebinding_panics() {
        let associated = AssociatedThreadId::create_bound();
        associated.bind_to_current_thread();
    }

    #[test]
    fn unbound_check_is_a_no_op() {
        let associated = AssociatedThreadId::create_unbound();
        associated.check_on_associated_thread();
    }
}
