use std::fmt;
use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// Idle sessions belonging to one stripe of the pool.
///
/// Safe for any number of concurrent producers and consumers without external locking.
pub(crate) struct Partition<S> {
    idle: SegQueue<PooledHandle<S>>,
}

impl<S> Partition<S> {
    pub(crate) fn new() -> Self {
        Self {
            idle: SegQueue::new(),
        }
    }

    /// Takes one idle session, if there is any.
    pub(crate) fn pop(&self) -> Option<PooledHandle<S>> {
        self.idle.pop()
    }

    /// Stores a session for reuse. The handle must no longer be tagged with a destination.
    pub(crate) fn push(&self, handle: PooledHandle<S>) {
        debug_assert!(
            handle.destination.is_none(),
            "idle sessions must not carry a return destination"
        );

        self.idle.push(handle);
    }

    /// Approximate number of idle sessions, racy under concurrent access.
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len()
    }
}

impl<S> fmt::Debug for Partition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("session_type", &format_args!("{}", std::any::type_name::<S>()))
            .field("idle", &self.idle.len())
            .finish()
    }
}

/// A session together with the partition it must go back to.
///
/// The destination is set while the session is checked out and cleared at the moment it is
/// returned, so an idle handle never points anywhere.
pub(crate) struct PooledHandle<S> {
    pub(crate) session: S,
    pub(crate) destination: Option<Arc<Partition<S>>>,
}

impl<S> PooledHandle<S> {
    pub(crate) const fn idle(session: S) -> Self {
        Self {
            session,
            destination: None,
        }
    }

    /// Detaches the handle from its destination and puts it back into idle storage there.
    ///
    /// Returns `false` if the handle had no destination, in which case it is dropped.
    pub(crate) fn return_home(mut self) -> bool {
        match self.destination.take() {
            Some(partition) => {
                partition.push(self);
                true
            }
            None => false,
        }
    }
}

impl<S> fmt::Debug for PooledHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("session_type", &format_args!("{}", std::any::type_name::<S>()))
            .field("checked_out", &self.destination.is_some())
            .finish_non_exhaustive()
    }
}
