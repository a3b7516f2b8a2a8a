//! Hardware topology provider.
//!
//! The partitioner only ever sees the topology through the small [`Topology`] trait; discovery
//! itself (hwloc, sysfs, platform APIs) belongs to the embedding runtime. A conservative
//! fallback implementation is provided so the crate is usable without any discovery library.

use std::num::NonZeroUsize;
#[cfg(any(test, feature = "test-util"))]
use std::sync::Arc;

#[cfg(any(test, feature = "test-util"))]
use crate::fake::FakeTopology;

/// The topology operations the partitioner consumes.
///
/// Core indexes are global (counted across all NUMA domains in topology order), matching the
/// global PU indexes used throughout the crate.
pub trait Topology {
    /// Total number of processing units on the machine (`hardware_concurrency`).
    fn number_of_pus(&self) -> usize;

    /// Number of NUMA domains, or zero if the machine does not report any.
    fn number_of_numa_nodes(&self) -> usize;

    /// Number of sockets; consulted only when [`number_of_numa_nodes`][Self::number_of_numa_nodes]
    /// reports zero.
    fn number_of_sockets(&self) -> usize;

    /// Number of cores within NUMA domain `domain`.
    fn number_of_numa_node_cores(&self, domain: usize) -> usize;

    /// Number of processing units within the core at global index `core`.
    fn number_of_core_pus(&self, core: usize) -> usize;
}

/// Topology for platforms without a discovery library: one NUMA domain containing
/// [`std::thread::available_parallelism()`] single-PU cores.
///
/// This keeps every placement computation valid (worker counts, masks, budgets) while making
/// no claim about cache or memory locality.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackTopology;

impl FallbackTopology {
    /// Creates the fallback topology.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn pu_count(self) -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

impl Topology for FallbackTopology {
    fn number_of_pus(&self) -> usize {
        self.pu_count()
    }

    fn number_of_numa_nodes(&self) -> usize {
        1
    }

    fn number_of_sockets(&self) -> usize {
        1
    }

    fn number_of_numa_node_cores(&self, domain: usize) -> usize {
        if domain == 0 { self.pu_count() } else { 0 }
    }

    fn number_of_core_pus(&self, core: usize) -> usize {
        if core < self.pu_count() { 1 } else { 0 }
    }
}

/// Dispatches [`Topology`] operations to the real machine topology or to a fake one.
#[derive(Clone, Debug)]
pub enum TopologyFacade {
    /// The conservative fallback for the machine the process runs on.
    Fallback(FallbackTopology),

    /// Simulated hardware for testing.
    #[cfg(any(test, feature = "test-util"))]
    Fake(Arc<FakeTopology>),
}

impl TopologyFacade {
    /// Returns the topology of the machine the process is running on.
    #[must_use]
    pub fn real() -> Self {
        Self::Fallback(FallbackTopology::new())
    }

    /// Wraps a fake topology for testing.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn from_fake(fake: FakeTopology) -> Self {
        Self::Fake(Arc::new(fake))
    }
}

impl Topology for TopologyFacade {
    fn number_of_pus(&self) -> usize {
        match self {
            Self::Fallback(t) => t.number_of_pus(),
            #[cfg(any(test, feature = "test-util"))]
            Self::Fake(t) => t.number_of_pus(),
        }
    }

    fn number_of_numa_nodes(&self) -> usize {
        match self {
            Self::Fallback(t) => t.number_of_numa_nodes(),
            #[cfg(any(test, feature = "test-util"))]
            Self::Fake(t) => t.number_of_numa_nodes(),
        }
    }

    fn number_of_sockets(&self) -> usize {
        match self {
            Self::Fallback(t) => t.number_of_sockets(),
            #[cfg(any(test, feature = "test-util"))]
            Self::Fake(t) => t.number_of_sockets(),
        }
    }

    fn number_of_numa_node_cores(&self, domain: usize) -> usize {
        match self {
            Self::Fallback(t) => t.number_of_numa_node_cores(domain),
            #[cfg(any(test, feature = "test-util"))]
            Self::Fake(t) => t.number_of_numa_node_cores(domain),
        }
    }

    fn number_of_core_pus(&self, core: usize) -> usize {
        match self {
            Self::Fallback(t) => t.number_of_core_pus(core),
            #[cfg(any(test, feature = "test-util"))]
            Self::Fake(t) => t.number_of_core_pus(core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_reports_one_domain_of_single_pu_cores() {
        let topology = FallbackTopology::new();
        let pus = topology.number_of_pus();

        assert!(pus >= 1);
        assert_eq!(topology.number_of_numa_nodes(), 1);
        assert_eq!(topology.number_of_numa_node_cores(0), pus);
        assert_eq!(topology.number_of_numa_node_cores(1), 0);
        assert_eq!(topology.number_of_core_pus(0), 1);
        assert_eq!(topology.number_of_core_pus(pus), 0);
    }

    #[test]
    fn facade_delegates_to_fallback() {
        let facade = TopologyFacade::real();

        assert_eq!(
            facade.number_of_pus(),
            FallbackTopology::new().number_of_pus()
        );
    }
}
