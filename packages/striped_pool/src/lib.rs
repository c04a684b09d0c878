#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A striped pool of reusable database sessions.
//!
//! This crate provides [`StripedPool`], a session pool built for many threads acquiring and
//! releasing sessions at a high rate. Idle sessions are spread over a set of partitions and every
//! thread is assigned a stripe that selects the partition it normally works with, so threads
//! rarely touch the same memory.
//!
//! # Key Features
//!
//! - **Lock-free fast path**: taking and returning an idle session never blocks
//! - **Growing partition table**: when a stripe runs dry, the table doubles up to a ceiling
//!   derived from the processor count
//! - **Reentrant per thread**: nested [`acquire()`][StripedPool::acquire] calls on one thread
//!   share a single session, which returns to the pool when the last lease is released
//! - **Bounded**: the pool never constructs more than its maximum number of sessions and fails
//!   fast with [`Error::Saturated`] instead of waiting
//! - **Gauges**: [`available_connections()`][StripedPool::available_connections],
//!   [`created_instances()`][StripedPool::created_instances] and
//!   [`max_size()`][StripedPool::max_size] for monitoring
//!
//! The pool does not know anything about databases. Sessions are provided by a
//! [`SessionFactory`] and only need to implement [`Session`], which lets the pool open a session
//! with the pool's [`Credentials`] when handing it out and close it when it comes back.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//!
//! use striped_pool::{Credentials, Session, SessionFactory, StripedPool};
//!
//! #[derive(Debug, Default)]
//! struct MemorySession {
//!     user: Option<String>,
//! }
//!
//! impl Session for MemorySession {
//!     type Error = Infallible;
//!
//!     fn open(&mut self, credentials: &Credentials) -> Result<(), Infallible> {
//!         self.user = Some(credentials.username().to_owned());
//!         Ok(())
//!     }
//!
//!     fn close(&mut self) {
//!         self.user = None;
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct MemorySessionFactory;
//!
//! impl SessionFactory for MemorySessionFactory {
//!     type Session = MemorySession;
//!
//!     fn create(&self, _url: &str) -> MemorySession {
//!         MemorySession::default()
//!     }
//! }
//!
//! let pool = StripedPool::new(MemorySessionFactory, "memory:orders", "admin", "admin");
//!
//! let lease = pool.acquire().unwrap();
//! assert_eq!(lease.session().user.as_deref(), Some("admin"));
//! ```
//!
//! # Observability
//!
//! Structural changes and failures are logged via `tracing` at `debug` level. Counts of
//! acquisitions by source (reentrant, idle, stolen, new), saturation, open failures and
//! structural changes are published as `nm` events with the `striped_pool_` prefix.

mod borrow_state;
mod builder;
mod busy_flag;
mod clients;
mod error;
#[cfg(test)]
mod fake;
mod metrics;
mod partition;
mod partition_table;
mod pool;
mod pooled;
mod session;

pub use builder::*;
pub(crate) use busy_flag::*;
pub(crate) use clients::*;
pub use error::{Error, Result};
pub(crate) use partition::*;
pub(crate) use partition_table::PartitionTable;
pub use pool::StripedPool;
pub use pooled::PooledSession;
pub use session::*;
