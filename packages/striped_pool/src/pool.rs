use std::cell::RefCell;
use std::fmt;
use std::hint;
use std::num::NonZero;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use nm::Event;

use crate::borrow_state::{self, PoolToken, Reentry};
use crate::metrics::AcquiredFrom;
use crate::partition_table::INITIAL_PARTITION_COUNT;
use crate::{
    BusyFlag, Credentials, Error, HardwareInfoClientFacade, Partition, PartitionTable,
    PooledHandle, PooledSession, Result, Session, SessionFactory, StripedPoolBuilder, metrics,
};

/// Number of idle sessions a partition is populated with when it is created.
const PARTITION_BOOTSTRAP_SIZE: usize = 1;

type SessionError<F> = <<F as SessionFactory>::Session as Session>::Error;

/// A pool of reusable database sessions, striped across partitions to keep contention
/// low when many threads acquire and release sessions at the same time.
///
/// Each thread is assigned a stripe on first use and takes idle sessions from the partition
/// of its stripe. Taking and returning a session never locks. Only structural changes
/// (creating a partition, growing the partition table) are serialized, and even those never
/// make another thread wait - a thread that loses the race simply looks again.
///
/// Acquisition is reentrant per thread: while a thread holds a session, further calls to
/// [`acquire()`][Self::acquire] on the same thread hand out the same session again, and the
/// session only goes back to the pool when the last of these leases is released.
///
/// The pool never waits for a session to become available. When the configured maximum
/// number of sessions exists and none is idle, [`acquire()`][Self::acquire] fails immediately
/// with [`Error::Saturated`].
///
/// Every thread that uses the pool keeps a small record of its borrow for it. The record is
/// removed when the pool is dropped on that thread. Other threads discard their records the
/// next time they start using a pool they have not used before.
///
/// # Example
///
/// ```
/// # use std::convert::Infallible;
/// # use striped_pool::{Credentials, Session, SessionFactory};
/// # #[derive(Debug)]
/// # struct MemorySession { open: bool }
/// # impl Session for MemorySession {
/// #     type Error = Infallible;
/// #     fn open(&mut self, _: &Credentials) -> Result<(), Infallible> { self.open = true; Ok(()) }
/// #     fn close(&mut self) { self.open = false; }
/// # }
/// # #[derive(Debug)]
/// # struct MemorySessionFactory;
/// # impl SessionFactory for MemorySessionFactory {
/// #     type Session = MemorySession;
/// #     fn create(&self, _: &str) -> MemorySession { MemorySession { open: false } }
/// # }
/// use striped_pool::StripedPool;
///
/// let pool = StripedPool::new(MemorySessionFactory, "memory:orders", "admin", "admin");
///
/// {
///     let lease = pool.acquire().unwrap();
///     assert!(lease.session().open);
///
///     // Same thread, same session.
///     let nested = pool.acquire().unwrap();
///     assert!(lease.is_same_session(&nested));
/// }
///
/// // Both leases are gone, so the session is back in the pool.
/// assert_eq!(pool.available_connections(), pool.created_instances());
/// ```
pub struct StripedPool<F>
where
    F: SessionFactory,
{
    /// Identifies the per-thread borrow state that belongs to this pool.
    token: PoolToken,

    factory: F,
    url: String,
    credentials: Credentials,

    max_size: usize,

    /// The table never grows beyond this length. Always a power of two.
    max_partitions: usize,

    /// Replaced wholesale when growing, never mutated in place except for
    /// filling empty slots.
    table: ArcSwap<PartitionTable<F::Session>>,

    /// Serializes structural changes to `table`. Readers never look at it.
    busy: BusyFlag,

    /// Number of sessions constructed so far (including reservations for sessions that
    /// are being constructed right now).
    current_size: AtomicUsize,

    /// Number of threads currently holding a session, counted once per thread regardless
    /// of how many reentrant leases the thread holds.
    acquired_connections: AtomicUsize,
}

impl<F> StripedPool<F>
where
    F: SessionFactory,
{
    /// Creates a pool with the default maximum size of [`DEFAULT_MAX_SIZE`][1] sessions.
    ///
    /// The pool starts with two partitions, each holding one unopened session.
    ///
    /// [1]: crate::DEFAULT_MAX_SIZE
    #[must_use]
    pub fn new(
        factory: F,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::builder(factory)
            .url(url)
            .credentials(username, password)
            .build()
    }

    /// Creates a builder that can be used to customize the pool.
    pub fn builder(factory: F) -> StripedPoolBuilder<F> {
        StripedPoolBuilder::new(factory)
    }

    pub(crate) fn new_inner(
        factory: F,
        url: String,
        credentials: Credentials,
        max_size: NonZero<usize>,
        max_partitions: Option<NonZero<usize>>,
        hardware_info: &HardwareInfoClientFacade,
    ) -> Self {
        let pool = Self {
            token: PoolToken::new(),
            factory,
            url,
            credentials,
            max_size: max_size.get(),
            max_partitions: hardware_info.partition_ceiling(max_partitions),
            table: ArcSwap::from_pointee(PartitionTable::empty(INITIAL_PARTITION_COUNT)),
            busy: BusyFlag::new(),
            current_size: AtomicUsize::new(0),
            acquired_connections: AtomicUsize::new(0),
        };

        {
            let table = pool.table.load();

            for index in 0..table.len() {
                table.fill(index, pool.bootstrap_partition());
            }
        }

        tracing::debug!(
            pool_id = pool.token.id(),
            url = %pool.url,
            max_size = pool.max_size,
            max_partitions = pool.max_partitions,
            created = pool.created_instances(),
            "session pool created"
        );

        pool
    }

    /// Acquires a session for the current thread.
    ///
    /// If the current thread already holds a session from this pool, the same session is
    /// handed out again and no pool state is touched. Otherwise an idle session is taken from
    /// the pool (or a new one constructed, up to the maximum size) and opened with the pool's
    /// credentials.
    ///
    /// The session returns to the pool once every lease acquired on this thread is released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Saturated`] if the pool has constructed its maximum number of sessions
    /// and none of them is idle. Returns [`Error::Open`] if the session fails to open.
    ///
    /// In both cases the pool's accounting is left exactly as it was before the call.
    pub fn acquire(&self) -> Result<PooledSession<'_, F>, SessionError<F>> {
        let stripe_key = match borrow_state::try_reenter::<F::Session>(&self.token) {
            Reentry::Reentered(handle) => {
                metrics::ACQUIRED_REENTRANT.with(Event::observe_once);
                return Ok(PooledSession::new(self, handle));
            }
            Reentry::Idle { stripe_key } => stripe_key,
        };

        self.acquired_connections.fetch_add(1, Ordering::AcqRel);

        // Until we hand out the session, any exit (error or panic in session code)
        // must undo the occupancy increment.
        let occupancy = scopeguard::guard((), |()| {
            self.acquired_connections.fetch_sub(1, Ordering::AcqRel);
        });

        let (handle, source) = self.check_out(stripe_key)?;

        scopeguard::ScopeGuard::into_inner(occupancy);
        source.observe();

        let handle = Rc::new(RefCell::new(handle));
        borrow_state::enter(&self.token, Rc::clone(&handle));

        Ok(PooledSession::new(self, handle))
    }

    /// Obtains an opened session tagged with the partition it must be returned to.
    #[cfg_attr(test, mutants::skip)] // Mutations easily turn the retry loop into an infinite loop.
    fn check_out(
        &self,
        stripe_key: usize,
    ) -> Result<(PooledHandle<F::Session>, AcquiredFrom), SessionError<F>> {
        loop {
            let table = self.table.load_full();
            let index = table.stripe_index(stripe_key);

            let Some(partition) = table.partition(index) else {
                self.try_create_partition(&table, index);
                continue;
            };

            if let Some(handle) = partition.pop() {
                return Ok((self.open(handle, partition)?, AcquiredFrom::Idle));
            }

            if table.len() < self.max_partitions {
                self.try_grow_table(&table);
                continue;
            }

            // This stripe is saturated and the table cannot grow any further. From here on
            // the pool behaves as a fixed set of partitions limited by session count.
            if self.try_reserve_session() {
                return Ok((self.construct(partition)?, AcquiredFrom::New));
            }

            // No construction capacity left. An idle session elsewhere still beats failing.
            if let Some(handle) = table.find_map_from(index, |other| other.pop()) {
                return Ok((self.open(handle, partition)?, AcquiredFrom::Stolen));
            }

            metrics::SATURATED.with(Event::observe_once);
            tracing::debug!(
                pool_id = self.token.id(),
                max_size = self.max_size,
                "session pool saturated"
            );

            return Err(Error::Saturated {
                max_size: self.max_size,
            });
        }
    }

    /// Opens a session taken from idle storage. On failure, the session goes back to where
    /// it came from so that the pool does not lose capacity.
    fn open(
        &self,
        handle: PooledHandle<F::Session>,
        partition: Arc<Partition<F::Session>>,
    ) -> Result<PooledHandle<F::Session>, SessionError<F>> {
        // If the session panics, it is lost while unwinding and no longer counts as constructed.
        let mut handle = scopeguard::guard(handle, |_lost| {
            self.current_size.fetch_sub(1, Ordering::AcqRel);
        });

        let opened = handle.session.open(&self.credentials);

        let mut handle = scopeguard::ScopeGuard::into_inner(handle);

        if let Err(error) = opened {
            metrics::OPEN_FAILED.with(Event::observe_once);
            tracing::debug!(pool_id = self.token.id(), %error, "failed to reopen idle session");

            handle.session.close();
            partition.push(handle);

            return Err(Error::Open(error));
        }

        handle.destination = Some(partition);
        Ok(handle)
    }

    /// Constructs and opens a brand new session. The caller must have reserved it via
    /// `try_reserve_session()`. The reservation is given back if this fails.
    fn construct(
        &self,
        partition: Arc<Partition<F::Session>>,
    ) -> Result<PooledHandle<F::Session>, SessionError<F>> {
        // If anything below fails or panics, the reservation is given back.
        let reservation = scopeguard::guard((), |()| {
            self.current_size.fetch_sub(1, Ordering::AcqRel);
        });

        let mut session = self.factory.create(&self.url);

        if let Err(error) = session.open(&self.credentials) {
            metrics::OPEN_FAILED.with(Event::observe_once);
            tracing::debug!(pool_id = self.token.id(), %error, "failed to open new session");

            return Err(Error::Open(error));
        }

        scopeguard::ScopeGuard::into_inner(reservation);

        tracing::trace!(
            pool_id = self.token.id(),
            created = self.created_instances(),
            "constructed new session"
        );

        Ok(PooledHandle {
            session,
            destination: Some(partition),
        })
    }

    /// Counts one more constructed session, unless that would exceed the maximum size.
    fn try_reserve_session(&self) -> bool {
        self.current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(1).filter(|&next| next <= self.max_size)
            })
            .is_ok()
    }

    /// Creates a new partition populated with the bootstrap sessions that still fit
    /// within the maximum size.
    fn bootstrap_partition(&self) -> Arc<Partition<F::Session>> {
        let partition = Arc::new(Partition::new());

        for _ in 0..PARTITION_BOOTSTRAP_SIZE {
            if !self.try_reserve_session() {
                break;
            }

            let reservation = scopeguard::guard((), |()| {
                self.current_size.fetch_sub(1, Ordering::AcqRel);
            });

            partition.push(PooledHandle::idle(self.factory.create(&self.url)));

            scopeguard::ScopeGuard::into_inner(reservation);
        }

        partition
    }

    /// Fills an empty slot of the table with a new partition, unless another thread is
    /// already changing the structure or the table has been replaced in the meantime.
    fn try_create_partition(&self, observed: &Arc<PartitionTable<F::Session>>, index: usize) {
        let Some(_busy) = self.busy.try_raise() else {
            hint::spin_loop();
            return;
        };

        if !Arc::ptr_eq(&self.table.load(), observed) || observed.partition(index).is_some() {
            return;
        }

        let partition = self.bootstrap_partition();
        let filled = observed.fill(index, partition);
        debug_assert!(filled, "busy flag guarantees nobody else fills the slot");

        metrics::PARTITIONS_CREATED.with(Event::observe_once);
        tracing::debug!(
            pool_id = self.token.id(),
            index,
            partitions = observed.len(),
            "created partition"
        );
    }

    /// Publishes a table twice as long as the observed one, unless another thread is already
    /// changing the structure or the table has been replaced in the meantime.
    fn try_grow_table(&self, observed: &Arc<PartitionTable<F::Session>>) {
        let Some(_busy) = self.busy.try_raise() else {
            hint::spin_loop();
            return;
        };

        if !Arc::ptr_eq(&self.table.load(), observed) {
            return;
        }

        let grown = observed.doubled();
        let new_len = grown.len();
        debug_assert!(new_len <= self.max_partitions);

        self.table.store(Arc::new(grown));

        metrics::TABLE_GROWN.with(Event::observe_once);
        tracing::debug!(
            pool_id = self.token.id(),
            partitions = new_len,
            max_partitions = self.max_partitions,
            "grew partition table"
        );
    }

    /// Releases one lease held by the current thread. Called when a lease is dropped.
    ///
    /// Once the thread's last lease is gone, the session is closed and returned to the
    /// partition it was taken for.
    pub(crate) fn release(&self) {
        let Some(handle) = borrow_state::leave::<F::Session>(&self.token) else {
            return;
        };

        let handle = Rc::into_inner(handle)
            .expect("the thread's last lease is gone, so the borrow state holds the only reference")
            .into_inner();

        // The thread stops holding a session even if closing it panics.
        let _occupancy = scopeguard::guard((), |()| {
            self.acquired_connections.fetch_sub(1, Ordering::AcqRel);
        });

        // A session that panics while closing is lost and no longer counts as constructed.
        let mut handle = scopeguard::guard(handle, |_lost| {
            self.current_size.fetch_sub(1, Ordering::AcqRel);
        });

        handle.session.close();

        let returned = scopeguard::ScopeGuard::into_inner(handle).return_home();
        debug_assert!(returned, "checked out sessions always carry a destination");
    }

    /// Approximate number of constructed sessions that are not currently held by any thread.
    ///
    /// This is a racy gauge. It is never negative, even if the counters are observed in the
    /// middle of an acquisition.
    #[must_use]
    pub fn available_connections(&self) -> usize {
        let created = self.current_size.load(Ordering::Acquire);
        let acquired = self.acquired_connections.load(Ordering::Acquire);

        created.saturating_sub(acquired)
    }

    /// Number of sessions the pool has constructed so far.
    #[must_use]
    pub fn created_instances(&self) -> usize {
        self.current_size.load(Ordering::Acquire)
    }

    /// Maximum number of sessions the pool will construct.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current number of partitions. Always a power of two and never decreases.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.table.load().len()
    }

    /// The number of partitions beyond which the pool stops growing.
    #[must_use]
    pub fn max_partitions(&self) -> usize {
        self.max_partitions
    }

    /// The URL sessions are created for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of idle sessions across all partitions. Racy under concurrent access.
    #[must_use]
    pub fn idle_sessions(&self) -> usize {
        self.table.load().idle_len()
    }

    /// Number of leases the current thread holds on this pool.
    #[must_use]
    pub fn current_thread_leases(&self) -> usize {
        borrow_state::acquire_count::<F::Session>(&self.token)
    }
}

impl<F> fmt::Debug for StripedPool<F>
where
    F: SessionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedPool")
            .field("pool_id", &self.token.id())
            .field(
                "factory_type",
                &format_args!("{}", std::any::type_name::<F>()),
            )
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .field("max_size", &self.max_size)
            .field("max_partitions", &self.max_partitions)
            .field("table", &self.table)
            .field("busy", &self.busy)
            .field("current_size", &self.current_size)
            .field("acquired_connections", &self.acquired_connections)
            .finish_non_exhaustive()
    }
}

impl<F> Drop for StripedPool<F>
where
    F: SessionFactory,
{
    fn drop(&mut self) {
        // Idle sessions are dropped together with the table. Borrow states of this pool on
        // other threads become stale once the token is gone and are discarded lazily.
        borrow_state::forget(&self.token);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::fake::{FakeFactory, FakeSession};

    assert_impl_all!(StripedPool<FakeFactory>: Send, Sync);
    assert_not_impl_any!(PooledSession<'static, FakeFactory>: Send, Sync);

    fn pool_with(factory: FakeFactory, max_size: NonZero<usize>) -> StripedPool<FakeFactory> {
        StripedPool::builder(factory)
            .url("fake:db")
            .credentials("user", "pass")
            .max_size(max_size)
            .hardware_info(HardwareInfoClientFacade::fixed_processor_count(1))
            .build()
    }

    #[test]
    fn starts_with_two_bootstrapped_partitions() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        assert_eq!(pool.created_instances(), 2);
        assert_eq!(pool.available_connections(), 2);
        assert_eq!(pool.idle_sessions(), 2);
        assert_eq!(pool.partition_count(), 2);
        assert_eq!(pool.max_size(), 64);
        assert_eq!(pool.url(), "fake:db");

        // Bootstrap sessions are created but not opened.
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.opened(), 0);
    }

    #[test]
    fn partition_ceiling_is_derived_from_processor_count() {
        let mut hardware_info = crate::MockHardwareInfoClient::new();
        hardware_info.expect_processor_count().times(1).return_const(3_usize);

        let pool = StripedPool::builder(FakeFactory::new())
            .hardware_info(HardwareInfoClientFacade::from_mock(hardware_info))
            .build();

        // 3 processors * 8 = 24, rounded down to a power of two.
        assert_eq!(pool.max_partitions(), 16);
    }

    #[test]
    fn explicit_partition_ceiling_skips_hardware_lookup() {
        let mut hardware_info = crate::MockHardwareInfoClient::new();
        hardware_info.expect_processor_count().never();

        let pool = StripedPool::builder(FakeFactory::new())
            .max_partitions(nz!(5))
            .hardware_info(HardwareInfoClientFacade::from_mock(hardware_info))
            .build();

        assert_eq!(pool.max_partitions(), 4);
    }

    #[test]
    fn bootstrap_respects_max_size() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(1));

        assert_eq!(pool.created_instances(), 1);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn acquire_opens_with_pool_credentials() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        let lease = pool.acquire().unwrap();

        let session = lease.session();
        assert!(session.is_open());
        assert_eq!(session.url(), "fake:db");
        assert_eq!(session.username(), Some("user"));
        drop(session);

        assert_eq!(pool.available_connections(), 1);
        assert_eq!(pool.current_thread_leases(), 1);
    }

    #[test]
    fn release_round_trip_reuses_session() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        let first_id = {
            let lease = pool.acquire().unwrap();
            lease.session().id()
        };

        assert_eq!(pool.created_instances(), 2);
        assert_eq!(pool.available_connections(), 2);
        assert_eq!(factory.closed(), 1);

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.session().id(), first_id);
        assert!(lease.session().is_open());
        assert_eq!(pool.created_instances(), 2);
    }

    #[test]
    fn reentrant_acquire_counts_occupancy_once() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        let outer = pool.acquire().unwrap();
        assert_eq!(pool.available_connections(), 1);

        let inner = pool.acquire().unwrap();
        assert!(outer.is_same_session(&inner));
        assert_eq!(pool.available_connections(), 1);
        assert_eq!(pool.current_thread_leases(), 2);
        assert_eq!(factory.opened(), 1);

        drop(outer);

        // Still held through the inner lease.
        assert_eq!(pool.available_connections(), 1);
        assert_eq!(factory.closed(), 0);
        assert!(inner.session().is_open());

        drop(inner);

        assert_eq!(pool.available_connections(), 2);
        assert_eq!(pool.current_thread_leases(), 0);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.idle_sessions(), 2);
    }

    #[test]
    fn deeply_reentrant_acquire_returns_once() {
        const DEPTH: usize = 10;

        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        let leases = (0..DEPTH)
            .map(|_| pool.acquire().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(pool.current_thread_leases(), DEPTH);
        assert_eq!(pool.idle_sessions(), 1);

        for lease in leases {
            lease.release();
        }

        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.idle_sessions(), 2);
        assert_eq!(pool.created_instances(), 2);
    }

    #[test]
    fn session_mut_allows_mutation_visible_to_aliases() {
        let pool = pool_with(FakeFactory::new(), nz!(64));

        let outer = pool.acquire().unwrap();
        let inner = pool.acquire().unwrap();

        inner.session_mut().execute("SELECT 1");

        assert_eq!(outer.session().executed(), 1);
    }

    #[test]
    fn open_failure_of_idle_session_keeps_accounting() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        factory.fail_opens(true);

        let result = pool.acquire();
        assert!(matches!(result, Err(Error::Open(_))));

        assert_eq!(pool.created_instances(), 2);
        assert_eq!(pool.available_connections(), 2);
        assert_eq!(pool.idle_sessions(), 2);
        assert_eq!(pool.current_thread_leases(), 0);

        factory.fail_opens(false);

        let lease = pool.acquire().unwrap();
        assert!(lease.session().is_open());
    }

    #[test]
    fn saturated_when_every_session_is_held() {
        // The table cannot grow, so once both bootstrap sessions are held by other threads,
        // the only way to serve another thread would be a third session.
        let pool = StripedPool::builder(FakeFactory::new())
            .max_size(nz!(2))
            .max_partitions(nz!(2))
            .build();

        let barrier = Barrier::new(3);

        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let _lease = pool.acquire().unwrap();
                    barrier.wait();
                    barrier.wait();
                });
            }

            barrier.wait();

            assert_eq!(pool.created_instances(), 2);
            assert!(matches!(
                pool.acquire(),
                Err(Error::Saturated { max_size: 2 })
            ));
            assert_eq!(pool.available_connections(), 0);
            assert_eq!(pool.current_thread_leases(), 0);

            barrier.wait();
        });

        assert_eq!(pool.available_connections(), 2);
        assert_eq!(pool.created_instances(), 2);
    }

    /// Runs `f` on new threads until one of them is assigned the same partition of `pool` as
    /// the current thread, then returns what `f` returned there.
    ///
    /// The table must not grow while this runs.
    fn on_thread_sharing_stripe<R, G>(pool: &StripedPool<FakeFactory>, f: G) -> R
    where
        R: Send,
        G: Fn() -> R + Sync,
    {
        let stripe_index = || {
            let key = borrow_state::stripe_key::<FakeSession>(&pool.token);
            pool.table.load().stripe_index(key)
        };

        let ours = stripe_index();

        loop {
            let result = thread::scope(|s| {
                s.spawn(|| (stripe_index() == ours).then(&f))
                    .join()
                    .unwrap()
            });

            if let Some(result) = result {
                return result;
            }
        }
    }

    fn fixed_width_pool(factory: FakeFactory, max_size: NonZero<usize>) -> StripedPool<FakeFactory> {
        StripedPool::builder(factory)
            .max_size(max_size)
            .max_partitions(nz!(2))
            .build()
    }

    #[test]
    fn new_session_open_failure_rolls_back_created_count() {
        let factory = FakeFactory::new();
        let pool = fixed_width_pool(factory.clone(), nz!(3));

        // Empties the partition of our stripe.
        let held = pool.acquire().unwrap();

        on_thread_sharing_stripe(&pool, || {
            factory.fail_opens(true);
            assert!(matches!(pool.acquire(), Err(Error::Open(_))));
            assert_eq!(pool.created_instances(), 2);
            assert_eq!(pool.available_connections(), 1);

            factory.fail_opens(false);
            let _lease = pool.acquire().unwrap();
            assert_eq!(pool.created_instances(), 3);
        });

        drop(held);

        assert_eq!(pool.available_connections(), 3);
        assert_eq!(pool.idle_sessions(), 3);
    }

    #[test]
    fn constructs_before_taking_from_other_stripes() {
        let pool = fixed_width_pool(FakeFactory::new(), nz!(64));

        let _held = pool.acquire().unwrap();

        on_thread_sharing_stripe(&pool, || {
            let _lease = pool.acquire().unwrap();

            assert_eq!(pool.created_instances(), 3);
            // The neighbouring stripe keeps its idle session.
            assert_eq!(pool.idle_sessions(), 1);
        });
    }

    #[test]
    fn takes_from_other_stripes_once_max_size_is_reached() {
        let pool = fixed_width_pool(FakeFactory::new(), nz!(2));

        let _held = pool.acquire().unwrap();

        on_thread_sharing_stripe(&pool, || {
            let lease = pool.acquire().unwrap();

            assert!(lease.session().is_open());
            assert_eq!(pool.created_instances(), 2);
            assert_eq!(pool.idle_sessions(), 0);
        });

        // The stolen session went back to the stripe that took it.
        assert_eq!(pool.idle_sessions(), 1);
    }

    #[test]
    fn check_out_reports_where_the_session_came_from() {
        let factory = FakeFactory::new();
        let pool = fixed_width_pool(factory.clone(), nz!(64));
        let stripe_key = borrow_state::stripe_key::<FakeSession>(&pool.token);

        // A failed reopen is not an acquisition.
        factory.fail_opens(true);
        assert!(matches!(pool.check_out(stripe_key), Err(Error::Open(_))));
        factory.fail_opens(false);

        let (reused, source) = pool.check_out(stripe_key).unwrap();
        assert_eq!(source, AcquiredFrom::Idle);

        let (constructed, source) = pool.check_out(stripe_key).unwrap();
        assert_eq!(source, AcquiredFrom::New);

        for mut handle in [reused, constructed] {
            handle.session.close();
            assert!(handle.return_home());
        }

        assert_eq!(pool.idle_sessions(), 3);
    }

    #[test]
    fn panic_while_reopening_gives_back_capacity() {
        let factory = FakeFactory::new();
        let pool = fixed_width_pool(factory.clone(), nz!(2));

        factory.panic_on_open(true);
        let result = panic::catch_unwind(AssertUnwindSafe(|| pool.acquire().map(drop)));
        factory.panic_on_open(false);

        assert!(result.is_err());
        assert_eq!(factory.dropped(), 1);
        assert_eq!(pool.created_instances(), 1);
        assert_eq!(pool.available_connections(), 1);
        assert_eq!(pool.current_thread_leases(), 0);

        // The lost session can be replaced, so two threads can still hold one each.
        let _held = pool.acquire().unwrap();
        let served = thread::scope(|s| s.spawn(|| pool.acquire().is_ok()).join().unwrap());
        assert!(served);
        assert_eq!(pool.created_instances(), 2);
    }

    #[test]
    fn panic_while_closing_releases_occupancy() {
        let factory = FakeFactory::new();
        let pool = fixed_width_pool(factory.clone(), nz!(2));

        let lease = pool.acquire().unwrap();

        factory.panic_on_close(true);
        let result = panic::catch_unwind(AssertUnwindSafe(|| drop(lease)));
        factory.panic_on_close(false);

        assert!(result.is_err());
        assert_eq!(factory.dropped(), 1);
        assert_eq!(pool.current_thread_leases(), 0);
        assert_eq!(pool.created_instances(), 1);
        assert_eq!(pool.available_connections(), 1);

        let lease = pool.acquire().unwrap();
        assert!(lease.session().is_open());
    }

    #[test]
    fn available_connections_clamps_when_occupancy_runs_ahead() {
        let pool = pool_with(FakeFactory::new(), nz!(64));

        // Every acquire counts itself as occupying before it has a session, so for a moment
        // the occupancy can exceed the number of sessions.
        pool.acquired_connections.fetch_add(5, Ordering::AcqRel);

        assert_eq!(pool.created_instances(), 2);
        assert_eq!(pool.available_connections(), 0);

        pool.acquired_connections.fetch_sub(5, Ordering::AcqRel);

        assert_eq!(pool.available_connections(), 2);
    }

    #[test]
    fn available_connections_stays_in_range_while_saturated() {
        let pool = fixed_width_pool(FakeFactory::new(), nz!(1));
        let done = AtomicBool::new(false);

        let _held = pool.acquire().unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    assert!(pool.available_connections() <= pool.created_instances());
                }
            });

            let acquirers = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        for _ in 0..1000 {
                            assert!(matches!(pool.acquire(), Err(Error::Saturated { .. })));
                        }
                    })
                })
                .collect::<Vec<_>>();

            for acquirer in acquirers {
                acquirer.join().unwrap();
            }

            done.store(true, Ordering::Relaxed);
        });

        assert_eq!(pool.available_connections(), 0);
    }

    #[test]
    fn table_grows_when_stripe_is_empty() {
        let pool = StripedPool::builder(FakeFactory::new())
            .max_partitions(nz!(8))
            .build();

        let barrier = Barrier::new(5);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _lease = pool.acquire().unwrap();
                    barrier.wait();
                    barrier.wait();
                });
            }

            barrier.wait();

            // Four concurrent holders cannot be served by two bootstrap sessions alone.
            assert!(pool.created_instances() >= 4);
            assert!(pool.partition_count() > 2);
            assert!(pool.partition_count().is_power_of_two());
            assert!(pool.partition_count() <= 8);

            barrier.wait();
        });

        assert_eq!(pool.available_connections(), pool.created_instances());
    }

    #[test]
    fn leases_from_different_pools_are_independent() {
        let first = pool_with(FakeFactory::new(), nz!(64));
        let second = pool_with(FakeFactory::new(), nz!(64));

        let a = first.acquire().unwrap();
        let b = second.acquire().unwrap();

        assert_eq!(first.current_thread_leases(), 1);
        assert_eq!(second.current_thread_leases(), 1);

        drop(a);

        assert_eq!(first.current_thread_leases(), 0);
        assert_eq!(second.current_thread_leases(), 1);
        drop(b);
    }

    #[test]
    fn dropping_pool_drops_idle_sessions() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), nz!(64));

        drop(pool.acquire().unwrap());
        drop(pool);

        assert_eq!(factory.dropped(), 2);
    }

    #[test]
    fn debug_output_hides_password() {
        let pool = pool_with(FakeFactory::new(), nz!(64));

        let output = format!("{pool:?}");

        assert!(output.contains("fake:db"));
        assert!(!output.contains("pass\""));
    }
}
