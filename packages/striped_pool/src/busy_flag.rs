use std::sync::atomic::{AtomicBool, Ordering};

/// Advisory mutual exclusion for structural changes to the partition table.
///
/// This is never waited on. A caller that fails to raise the flag knows that another thread
/// is already changing the structure, so it goes back to re-reading the table instead.
#[derive(Debug, Default)]
pub(crate) struct BusyFlag {
    raised: AtomicBool,
}

impl BusyFlag {
    pub(crate) const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    /// Raises the flag if nobody else holds it. The flag is lowered when the guard is dropped.
    #[must_use]
    pub(crate) fn try_raise(&self) -> Option<BusyGuard<'_>> {
        self.raised
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard { flag: self })
    }

    #[cfg(test)]
    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.raised.store(false, Ordering::Release);
    }
}
