//! In-memory sessions for testing the pool without a database.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{Credentials, Session, SessionFactory};

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    dropped: AtomicUsize,
    fail_opens: AtomicBool,
    panic_on_open: AtomicBool,
    panic_on_close: AtomicBool,
}

/// Creates [`FakeSession`]s and counts what happens to them. Clones share the counters.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeFactory {
    counters: Arc<Counters>,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_opens(&self, fail: bool) {
        self.counters.fail_opens.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn panic_on_open(&self, panic: bool) {
        self.counters.panic_on_open.store(panic, Ordering::Relaxed);
    }

    pub(crate) fn panic_on_close(&self, panic: bool) {
        self.counters.panic_on_close.store(panic, Ordering::Relaxed);
    }

    pub(crate) fn created(&self) -> usize {
        self.counters.created.load(Ordering::Relaxed)
    }

    pub(crate) fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::Relaxed)
    }

    pub(crate) fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    fn create(&self, url: &str) -> FakeSession {
        let id = self.counters.created.fetch_add(1, Ordering::Relaxed);

        FakeSession {
            id,
            url: url.to_owned(),
            username: None,
            executed: 0,
            counters: Arc::clone(&self.counters),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FakeSession {
    id: usize,
    url: String,
    username: Option<String>,
    executed: usize,
    counters: Arc<Counters>,
}

impl FakeSession {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.username.is_some()
    }

    pub(crate) fn execute(&mut self, _statement: &str) {
        assert!(self.is_open(), "statement executed on a closed session");
        self.executed = self.executed.wrapping_add(1);
    }

    pub(crate) fn executed(&self) -> usize {
        self.executed
    }
}

#[derive(Debug)]
pub(crate) struct OpenRefused;

impl fmt::Display for OpenRefused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fake session refused to open")
    }
}

impl std::error::Error for OpenRefused {}

impl Session for FakeSession {
    type Error = OpenRefused;

    fn open(&mut self, credentials: &Credentials) -> Result<(), Self::Error> {
        assert!(
            !self.counters.panic_on_open.load(Ordering::Relaxed),
            "fake session panicked while opening"
        );

        if self.counters.fail_opens.load(Ordering::Relaxed) {
            return Err(OpenRefused);
        }

        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        self.username = Some(credentials.username().to_owned());
        Ok(())
    }

    fn close(&mut self) {
        assert!(
            !self.counters.panic_on_close.load(Ordering::Relaxed),
            "fake session panicked while closing"
        );

        if self.username.take().is_some() {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
