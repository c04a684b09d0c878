use many_cpus::SystemHardware;

/// Answers questions about the hardware the pool runs on.
///
/// Only used to derive the partition ceiling, so tests can pin it to a known value.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait HardwareInfoClient {
    /// Number of processors available to the current process.
    fn processor_count(&self) -> usize;
}

#[derive(Debug)]
pub(crate) struct HardwareInfoClientImpl;

impl HardwareInfoClient for HardwareInfoClientImpl {
    #[cfg_attr(test, mutants::skip)] // Trivial fn, tested on lower levels - skip mutating.
    fn processor_count(&self) -> usize {
        SystemHardware::current().processors().len()
    }
}
