use std::fmt;

/// A database session that can be pooled by a [`StripedPool`][crate::StripedPool].
///
/// The pool never executes queries itself. It only moves sessions between idle storage and
/// callers, opening a session when it is handed out and closing it when it comes back.
///
/// A pooled session goes through the cycle `open()` -> use -> `close()` -> idle -> `open()`
/// any number of times, so implementations must support reopening a closed session.
pub trait Session: Send + 'static {
    /// Error returned when a session cannot be opened.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens (or reopens) the session with the given credentials.
    ///
    /// This is called both on freshly created sessions and on sessions that were
    /// previously closed and returned to idle storage.
    ///
    /// # Errors
    ///
    /// Returns the implementation-specific error if the session cannot be opened. The pool
    /// propagates this error to the caller of [`acquire()`][crate::StripedPool::acquire] unchanged.
    fn open(&mut self, credentials: &Credentials) -> Result<(), Self::Error>;

    /// Closes the session, releasing any resources associated with the open state.
    ///
    /// Must not fail or panic when called on a session that has already been reset.
    fn close(&mut self);
}

/// Creates unopened sessions bound to a target URL.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
///
/// use striped_pool::{Credentials, Session, SessionFactory};
///
/// #[derive(Debug, Default)]
/// struct MemorySession {
///     open: bool,
/// }
///
/// impl Session for MemorySession {
///     type Error = Infallible;
///
///     fn open(&mut self, _credentials: &Credentials) -> Result<(), Self::Error> {
///         self.open = true;
///         Ok(())
///     }
///
///     fn close(&mut self) {
///         self.open = false;
///     }
/// }
///
/// #[derive(Debug)]
/// struct MemorySessionFactory;
///
/// impl SessionFactory for MemorySessionFactory {
///     type Session = MemorySession;
///
///     fn create(&self, _url: &str) -> MemorySession {
///         MemorySession::default()
///     }
/// }
/// ```
pub trait SessionFactory: Send + Sync + 'static {
    /// The type of session created by this factory.
    type Session: Session;

    /// Creates a new session for the given URL without opening it.
    fn create(&self, url: &str) -> Self::Session;
}

/// The username and password that the pool passes to [`Session::open()`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates a new set of credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username to open sessions with.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password to open sessions with.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &format_args!("<redacted>"))
            .finish()
    }
}
