use nm::Event;

thread_local! {
    pub(crate) static ACQUIRED_REENTRANT: Event = Event::builder()
        .name("striped_pool_acquired_reentrant")
        .build();

    pub(crate) static ACQUIRED_IDLE: Event = Event::builder()
        .name("striped_pool_acquired_idle")
        .build();

    pub(crate) static ACQUIRED_STOLEN: Event = Event::builder()
        .name("striped_pool_acquired_stolen")
        .build();

    pub(crate) static ACQUIRED_NEW: Event = Event::builder()
        .name("striped_pool_acquired_new")
        .build();

    pub(crate) static SATURATED: Event = Event::builder()
        .name("striped_pool_saturated")
        .build();

    pub(crate) static OPEN_FAILED: Event = Event::builder()
        .name("striped_pool_open_failed")
        .build();

    pub(crate) static PARTITIONS_CREATED: Event = Event::builder()
        .name("striped_pool_partitions_created")
        .build();

    pub(crate) static TABLE_GROWN: Event = Event::builder()
        .name("striped_pool_table_grown")
        .build();
}

/// Where a first (non-reentrant) acquisition on a thread found its session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AcquiredFrom {
    /// Reopened an idle session from the thread's own partition.
    Idle,

    /// Reopened an idle session taken from another partition.
    Stolen,

    /// Constructed and opened a new session.
    New,
}

impl AcquiredFrom {
    /// Records a successful acquisition.
    pub(crate) fn observe(self) {
        match self {
            Self::Idle => ACQUIRED_IDLE.with(Event::observe_once),
            Self::Stolen => ACQUIRED_STOLEN.with(Event::observe_once),
            Self::New => ACQUIRED_NEW.with(Event::observe_once),
        }
    }
}
