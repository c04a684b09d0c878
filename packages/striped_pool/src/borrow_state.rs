//! Per-thread, per-pool record of the session the current thread has borrowed.
//!
//! Every thread that touches a pool gets its own [`BorrowState`] for that pool, created lazily
//! on first use. The state is keyed by pool ID because one thread may use any number of pools,
//! each with its own session type.
//!
//! A thread only learns that a pool is gone when the pool is dropped on that same thread. The
//! other threads notice it through the pool's [`PoolToken`]: whenever a thread starts tracking
//! a pool it has not seen before, it first discards the states of pools that no longer exist.
//!
//! Access is always short and never calls into session or factory code while the thread-local
//! map is borrowed, so a session callback that itself uses a pool cannot trip over the map.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use foldhash::{HashMap, HashMapExt};

use crate::PooledHandle;

/// Fibonacci hashing increment (2^32 divided by the golden ratio). Successive threads get keys
/// spaced by this constant, which spreads them over the low bits used for stripe selection.
const STRIPE_KEY_INCREMENT: usize = 0x61c8_8647;

static NEXT_STRIPE_KEY: AtomicUsize = AtomicUsize::new(0);

fn next_stripe_key() -> usize {
    NEXT_STRIPE_KEY.fetch_add(STRIPE_KEY_INCREMENT, Ordering::Relaxed)
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// The session a thread holds, shared between all reentrant leases on that thread.
pub(crate) type SharedHandle<S> = Rc<RefCell<PooledHandle<S>>>;

/// Identifies one pool in the per-thread borrow states.
///
/// Owned by the pool. Threads only keep a weak reference to it, so dropping the token tells
/// every thread that its state for this pool can be discarded.
#[derive(Debug)]
pub(crate) struct PoolToken {
    id: u64,
    alive: Arc<()>,
}

impl PoolToken {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

struct TrackedPool {
    alive: Weak<()>,

    /// A `BorrowState<S>` for the session type of the pool.
    state: Box<dyn Any>,
}

impl TrackedPool {
    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

thread_local! {
    static BORROW_STATES: RefCell<HashMap<u64, TrackedPool>> = RefCell::new(HashMap::new());
}

pub(crate) struct BorrowState<S> {
    stripe_key: usize,

    /// Number of leases on this thread that have not been released yet. Zero when idle.
    acquire_count: usize,

    /// Only `Some` while `acquire_count` is positive.
    acquired: Option<SharedHandle<S>>,
}

impl<S> BorrowState<S> {
    fn new() -> Self {
        Self {
            stripe_key: next_stripe_key(),
            acquire_count: 0,
            acquired: None,
        }
    }
}

impl<S> fmt::Debug for BorrowState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowState")
            .field("stripe_key", &self.stripe_key)
            .field("acquire_count", &self.acquire_count)
            .field("acquired", &self.acquired.is_some())
            .finish()
    }
}

/// Removes the states of pools that have been dropped, unless `token`'s pool is already
/// tracked on this thread. The removed states are returned so that they are dropped after
/// the map is no longer borrowed.
fn prune_before_tracking(token: &PoolToken) -> Vec<TrackedPool> {
    BORROW_STATES.with_borrow_mut(|states| {
        if states.contains_key(&token.id) {
            return Vec::new();
        }

        let dead = states
            .iter()
            .filter(|(_, tracked)| !tracked.is_alive())
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        dead.iter().filter_map(|id| states.remove(id)).collect()
    })
}

fn with_state<S, F, R>(token: &PoolToken, f: F) -> R
where
    S: 'static,
    F: FnOnce(&mut BorrowState<S>) -> R,
{
    drop(prune_before_tracking(token));

    BORROW_STATES.with_borrow_mut(|states| {
        let tracked = states.entry(token.id).or_insert_with(|| TrackedPool {
            alive: Arc::downgrade(&token.alive),
            state: Box::new(BorrowState::<S>::new()),
        });

        let state = tracked
            .state
            .downcast_mut::<BorrowState<S>>()
            .expect("pool IDs are unique, so a pool's borrow state always has its session type");

        f(state)
    })
}

/// Outcome of trying to reenter an existing borrow on the current thread.
#[derive(Debug)]
pub(crate) enum Reentry<S> {
    /// The thread already held a session. The count has been incremented.
    Reentered(SharedHandle<S>),

    /// The thread holds nothing from this pool. It must check out a session using this key.
    Idle { stripe_key: usize },
}

/// Reenters the current thread's borrow if it has one.
pub(crate) fn try_reenter<S: 'static>(token: &PoolToken) -> Reentry<S> {
    with_state::<S, _, _>(token, |state| match state.acquired {
        Some(ref handle) if state.acquire_count > 0 => {
            state.acquire_count = state
                .acquire_count
                .checked_add(1)
                .expect("reentrant acquisitions cannot exceed usize::MAX");

            Reentry::Reentered(Rc::clone(handle))
        }
        _ => Reentry::Idle {
            stripe_key: state.stripe_key,
        },
    })
}

/// Records a freshly checked out session as the current thread's borrow, with a count of one.
pub(crate) fn enter<S: 'static>(token: &PoolToken, handle: SharedHandle<S>) {
    with_state::<S, _, _>(token, |state| {
        debug_assert_eq!(state.acquire_count, 0);

        state.acquire_count = 1;
        state.acquired = Some(handle);
    });
}

/// Releases one level of the current thread's borrow.
///
/// Returns the shared handle once the count reaches zero, at which point the caller is
/// responsible for returning the session to the pool. Returns `None` if the borrow is still
/// held at a lower level or if nothing was borrowed to begin with.
pub(crate) fn leave<S: 'static>(token: &PoolToken) -> Option<SharedHandle<S>> {
    with_state::<S, _, _>(token, |state| {
        if state.acquire_count == 0 {
            return None;
        }

        state.acquire_count = state.acquire_count.saturating_sub(1);

        if state.acquire_count > 0 {
            return None;
        }

        state.acquired.take()
    })
}

/// Number of outstanding leases for the pool on the current thread.
pub(crate) fn acquire_count<S: 'static>(token: &PoolToken) -> usize {
    with_state::<S, _, _>(token, |state| state.acquire_count)
}

/// The stripe key of the current thread for the pool. Does not touch the acquire count.
#[cfg(test)]
pub(crate) fn stripe_key<S: 'static>(token: &PoolToken) -> usize {
    with_state::<S, _, _>(token, |state| state.stripe_key)
}

/// Whether the current thread holds any state for the pool with the given ID.
#[cfg(test)]
pub(crate) fn is_tracked(pool_id: u64) -> bool {
    BORROW_STATES.with_borrow(|states| states.contains_key(&pool_id))
}

/// Forgets the current thread's state for a pool that is going away.
pub(crate) fn forget(token: &PoolToken) {
    // The thread-local may already be destroyed if the pool is dropped during thread teardown.
    let removed = BORROW_STATES
        .try_with(|states| {
            states
                .try_borrow_mut()
                .ok()
                .and_then(|mut states| states.remove(&token.id))
        })
        .ok()
        .flatten();

    drop(removed);
}
