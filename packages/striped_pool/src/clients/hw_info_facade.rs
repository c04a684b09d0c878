use std::num::NonZero;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::MockHardwareInfoClient;
use crate::partition_table::effective_ceiling;
use crate::{HardwareInfoClient, HardwareInfoClientImpl};

/// Each processor may be served by this many partitions before the table stops growing.
const PARTITIONS_PER_PROCESSOR: usize = 8;

/// Hardware facts the pool sizes itself by, either from the real system or from a test double.
#[derive(Clone, Debug)]
pub(crate) enum HardwareInfoClientFacade {
    Real(&'static HardwareInfoClientImpl),

    #[cfg(test)]
    Mock(Arc<MockHardwareInfoClient>),
}

impl HardwareInfoClientFacade {
    pub(crate) const fn real() -> Self {
        Self::Real(&HardwareInfoClientImpl)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockHardwareInfoClient) -> Self {
        Self::Mock(Arc::new(mock))
    }

    /// A test double that reports `count` processors however often it is asked.
    #[cfg(test)]
    pub(crate) fn fixed_processor_count(count: usize) -> Self {
        let mut mock = MockHardwareInfoClient::new();
        mock.expect_processor_count().return_const(count);
        Self::from_mock(mock)
    }

    /// The length the partition table of a new pool may grow to.
    ///
    /// An explicit request wins over the processor count, which is then never looked up.
    /// Either way the result is rounded down to a power of two no smaller than the initial
    /// table length.
    pub(crate) fn partition_ceiling(&self, requested: Option<NonZero<usize>>) -> usize {
        let requested = requested.map_or_else(
            || {
                self.processor_count()
                    .saturating_mul(PARTITIONS_PER_PROCESSOR)
            },
            NonZero::get,
        );

        effective_ceiling(requested)
    }
}

impl HardwareInfoClient for HardwareInfoClientFacade {
    #[cfg_attr(coverage_nightly, coverage(off))] // Pass-through.
    fn processor_count(&self) -> usize {
        match self {
            Self::Real(real) => real.processor_count(),
            #[cfg(test)]
            Self::Mock(mock) => mock.processor_count(),
        }
    }
}
