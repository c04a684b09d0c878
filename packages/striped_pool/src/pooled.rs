use std::cell::{Ref, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::borrow_state::SharedHandle;
use crate::{SessionFactory, StripedPool};

/// A session borrowed from a [`StripedPool`] by the current thread.
///
/// Dropping the lease (or calling [`release()`][Self::release]) gives up this lease. The
/// session itself goes back to the pool only when the thread has released every lease it
/// acquired, because reentrant acquisitions on one thread all share one session.
///
/// Leases cannot be sent to other threads - the session is bound to the thread that
/// acquired it until that thread releases it.
pub struct PooledSession<'a, F>
where
    F: SessionFactory,
{
    pool: &'a StripedPool<F>,

    // `None` only while the lease is being dropped.
    handle: Option<SharedHandle<F::Session>>,
}

impl<'a, F> PooledSession<'a, F>
where
    F: SessionFactory,
{
    pub(crate) fn new(pool: &'a StripedPool<F>, handle: SharedHandle<F::Session>) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    fn shared(&self) -> &SharedHandle<F::Session> {
        self.handle
            .as_ref()
            .expect("handle is only taken when the lease is dropped")
    }

    /// Borrows the session.
    ///
    /// # Panics
    ///
    /// Panics if the session is currently borrowed mutably through another lease
    /// held by this thread.
    #[must_use]
    pub fn session(&self) -> Ref<'_, F::Session> {
        Ref::map(self.shared().borrow(), |handle| &handle.session)
    }

    /// Borrows the session mutably.
    ///
    /// # Panics
    ///
    /// Panics if the session is currently borrowed through another lease held by this thread.
    #[must_use]
    pub fn session_mut(&self) -> RefMut<'_, F::Session> {
        RefMut::map(self.shared().borrow_mut(), |handle| &mut handle.session)
    }

    /// Whether two leases refer to the same pooled session.
    #[must_use]
    pub fn is_same_session(&self, other: &Self) -> bool {
        Rc::ptr_eq(self.shared(), other.shared())
    }

    /// The pool this lease was acquired from.
    #[must_use]
    pub fn pool(&self) -> &'a StripedPool<F> {
        self.pool
    }

    /// Releases the lease. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl<F> fmt::Debug for PooledSession<'_, F>
where
    F: SessionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field(
                "session_type",
                &format_args!("{}", std::any::type_name::<F::Session>()),
            )
            .field("pool", &format_args!("{:p}", self.pool))
            .finish_non_exhaustive()
    }
}

impl<F> Drop for PooledSession<'_, F>
where
    F: SessionFactory,
{
    fn drop(&mut self) {
        // Our reference must be gone before the pool looks at the handle, so that the last
        // lease on the thread leaves the borrow state holding the only reference.
        drop(self.handle.take());

        self.pool.release();
    }
}
