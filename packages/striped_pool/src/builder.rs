use std::fmt;
use std::num::NonZero;

use new_zealand::nz;

use crate::{Credentials, HardwareInfoClientFacade, SessionFactory, StripedPool};

/// Maximum number of sessions a pool constructs unless configured otherwise.
pub const DEFAULT_MAX_SIZE: NonZero<usize> = nz!(64);

/// Builder for creating an instance of [`StripedPool`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// [`StripedPool::new()`][1] covers the common case of a URL, credentials and the default
/// maximum size.
///
/// # Examples
///
/// ```
/// # use std::convert::Infallible;
/// # use striped_pool::{Credentials, Session, SessionFactory};
/// # #[derive(Debug)]
/// # struct MemorySession;
/// # impl Session for MemorySession {
/// #     type Error = Infallible;
/// #     fn open(&mut self, _: &Credentials) -> Result<(), Infallible> { Ok(()) }
/// #     fn close(&mut self) {}
/// # }
/// # #[derive(Debug)]
/// # struct MemorySessionFactory;
/// # impl SessionFactory for MemorySessionFactory {
/// #     type Session = MemorySession;
/// #     fn create(&self, _: &str) -> MemorySession { MemorySession }
/// # }
/// use new_zealand::nz;
/// use striped_pool::StripedPool;
///
/// let pool = StripedPool::builder(MemorySessionFactory)
///     .url("memory:orders")
///     .credentials("admin", "admin")
///     .max_size(nz!(16))
///     .build();
///
/// assert_eq!(pool.max_size(), 16);
/// ```
///
/// [1]: StripedPool::new
#[must_use]
pub struct StripedPoolBuilder<F> {
    factory: F,
    url: String,
    credentials: Credentials,
    max_size: NonZero<usize>,
    max_partitions: Option<NonZero<usize>>,
    hardware_info: HardwareInfoClientFacade,
}

impl<F> fmt::Debug for StripedPoolBuilder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedPoolBuilder")
            .field(
                "factory_type",
                &format_args!("{}", std::any::type_name::<F>()),
            )
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .field("max_size", &self.max_size)
            .field("max_partitions", &self.max_partitions)
            .finish_non_exhaustive()
    }
}

impl<F> StripedPoolBuilder<F>
where
    F: SessionFactory,
{
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            url: String::new(),
            credentials: Credentials::default(),
            max_size: DEFAULT_MAX_SIZE,
            max_partitions: None,
            hardware_info: HardwareInfoClientFacade::real(),
        }
    }

    /// Sets the URL that is passed to the factory when creating sessions.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the credentials that every session is opened with.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::new(username, password);
        self
    }

    /// Sets the maximum number of sessions the pool will ever construct.
    ///
    /// Defaults to [`DEFAULT_MAX_SIZE`].
    pub fn max_size(mut self, max_size: NonZero<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Overrides the maximum number of partitions the pool may grow to.
    ///
    /// By default this is derived from the number of processors available to the process
    /// (eight partitions per processor). The value is rounded down to a power of two and
    /// is never less than the two partitions every pool starts with.
    pub fn max_partitions(mut self, max_partitions: NonZero<usize>) -> Self {
        self.max_partitions = Some(max_partitions);
        self
    }

    #[cfg(test)]
    pub(crate) fn hardware_info(mut self, hardware_info: HardwareInfoClientFacade) -> Self {
        self.hardware_info = hardware_info;
        self
    }

    /// Builds the pool, eagerly creating its initial partitions and their sessions.
    #[must_use]
    pub fn build(self) -> StripedPool<F> {
        StripedPool::new_inner(
            self.factory,
            self.url,
            self.credentials,
            self.max_size,
            self.max_partitions,
            &self.hardware_info,
        )
    }
}
