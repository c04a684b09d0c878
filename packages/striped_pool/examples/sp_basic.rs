//! Demonstrates sharing a `StripedPool` between worker threads.
//!
//! Every worker acquires a session, runs a few pretend statements and calls a helper that
//! acquires again. The nested acquisition reuses the session the worker already holds.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use new_zealand::nz;
use striped_pool::{Credentials, Session, SessionFactory, StripedPool};

const WORKER_COUNT: usize = 8;
const ROUNDS_PER_WORKER: usize = 1000;

static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct DemoSession {
    id: usize,
    user: Option<String>,
    statements: usize,
}

impl DemoSession {
    fn execute(&mut self, _statement: &str) {
        self.statements = self.statements.wrapping_add(1);
    }
}

impl Session for DemoSession {
    type Error = Infallible;

    fn open(&mut self, credentials: &Credentials) -> Result<(), Infallible> {
        self.user = Some(credentials.username().to_owned());
        Ok(())
    }

    fn close(&mut self) {
        self.user = None;
    }
}

#[derive(Debug)]
struct DemoFactory;

impl SessionFactory for DemoFactory {
    type Session = DemoSession;

    fn create(&self, _url: &str) -> DemoSession {
        DemoSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            user: None,
            statements: 0,
        }
    }
}

fn record_audit_entry(pool: &StripedPool<DemoFactory>) {
    let lease = pool.acquire().unwrap();
    lease.session_mut().execute("INSERT INTO audit VALUES (?)");
}

fn main() {
    let pool = StripedPool::builder(DemoFactory)
        .url("memory:demo")
        .credentials("demo", "demo")
        .max_size(nz!(16))
        .build();

    println!(
        "Created pool for {} with {} sessions in {} partitions (at most {} partitions)",
        pool.url(),
        pool.created_instances(),
        pool.partition_count(),
        pool.max_partitions()
    );

    thread::scope(|s| {
        for _ in 0..WORKER_COUNT {
            s.spawn(|| {
                for _ in 0..ROUNDS_PER_WORKER {
                    let lease = pool.acquire().unwrap();
                    lease.session_mut().execute("SELECT 1");

                    record_audit_entry(&pool);
                }
            });
        }
    });

    println!(
        "After {} rounds: {} sessions created, {} available, {} partitions",
        WORKER_COUNT * ROUNDS_PER_WORKER,
        pool.created_instances(),
        pool.available_connections(),
        pool.partition_count()
    );

    let lease = pool.acquire().unwrap();
    let session = lease.session();
    println!(
        "This thread got session {} opened by {:?} with {} statements so far",
        session.id,
        session.user.as_deref(),
        session.statements
    );
}
