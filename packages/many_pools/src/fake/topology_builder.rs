//! Builder for configuring fake topologies.

use std::num::NonZero;

use nonempty::NonEmpty;

use crate::Topology;

/// The shape of one simulated NUMA domain: the PU count of each of its cores.
type DomainShape = Vec<usize>;

/// Builder for configuring a fake hardware topology.
///
/// # Construction modes
///
/// There are two mutually exclusive ways to describe the machine:
///
/// 1. **Quick mode** via [`uniform()`][Self::uniform]: every domain has the same number of
///    cores and every core the same number of PUs. This mode does not allow adding individual
///    domains via [`numa_node()`][Self::numa_node].
/// 2. **Custom mode** via [`new()`][Self::new] + [`numa_node()`][Self::numa_node]: domains are
///    added one by one, each described by the PU count of its cores.
///
/// Mixing the modes panics when the builder is consumed. A custom-mode builder with no domains
/// added builds a minimal machine of one domain with one single-PU core.
///
/// # Example (custom mode)
///
/// ```
/// use many_pools::Topology;
/// use many_pools::fake::TopologyBuilder;
///
/// // One domain with two dual-PU cores, one domain with a single four-PU core.
/// let topology = TopologyBuilder::new()
///     .numa_node([2, 2])
///     .numa_node([4])
///     .build();
///
/// assert_eq!(topology.number_of_pus(), 8);
/// assert_eq!(topology.number_of_numa_node_cores(0), 2);
/// assert_eq!(topology.number_of_core_pus(2), 4);
/// ```
#[derive(Clone, Debug)]
pub struct TopologyBuilder {
    domains: Vec<DomainShape>,
    report_zero_numa_nodes: bool,
    /// If true, this builder was created via `uniform()` and `numa_node()` is forbidden.
    uniform: bool,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyBuilder {
    /// Creates an empty builder in custom mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            domains: Vec::new(),
            report_zero_numa_nodes: false,
            uniform: false,
        }
    }

    /// Creates a builder in quick mode describing a machine of `numa_nodes` domains, each with
    /// `cores_per_node` cores of `pus_per_core` PUs.
    ///
    /// # Panics
    ///
    /// Panics if [`numa_node()`][Self::numa_node] is called on a builder created with this
    /// constructor.
    #[must_use]
    pub fn uniform(
        numa_nodes: NonZero<usize>,
        cores_per_node: NonZero<usize>,
        pus_per_core: NonZero<usize>,
    ) -> Self {
        let domains = (0..numa_nodes.get())
            .map(|_| vec![pus_per_core.get(); cores_per_node.get()])
            .collect();

        Self {
            domains,
            report_zero_numa_nodes: false,
            uniform: true,
        }
    }

    /// Adds one NUMA domain whose cores have the given PU counts.
    ///
    /// # Panics
    ///
    /// Panics if the builder was created via [`uniform()`][Self::uniform], or if `core_pu_counts`
    /// is empty or contains a zero-PU core.
    #[must_use]
    pub fn numa_node(mut self, core_pu_counts: impl IntoIterator<Item = usize>) -> Self {
        assert!(
            !self.uniform,
            "numa_node() is not allowed on a builder created via uniform()"
        );

        let shape: DomainShape = core_pu_counts.into_iter().collect();
        assert!(!shape.is_empty(), "a NUMA domain must have at least one core");
        assert!(
            shape.iter().all(|pus| *pus > 0),
            "every core must have at least one PU"
        );

        self.domains.push(shape);
        self
    }

    /// Makes the built topology report zero NUMA domains, forcing consumers onto the
    /// socket-count path. The domain shapes are then reported as sockets.
    #[must_use]
    pub fn report_zero_numa_nodes(mut self) -> Self {
        self.report_zero_numa_nodes = true;
        self
    }

    /// Consumes the builder and produces the fake topology.
    #[must_use]
    pub fn build(self) -> FakeTopology {
        let domains = NonEmpty::from_vec(self.domains)
            // An unconfigured custom-mode builder means "the smallest possible machine".
            .unwrap_or_else(|| NonEmpty::singleton(vec![1]));

        FakeTopology {
            domains,
            report_zero_numa_nodes: self.report_zero_numa_nodes,
        }
    }
}

/// A simulated hardware topology produced by [`TopologyBuilder`].
#[derive(Clone, Debug)]
pub struct FakeTopology {
    domains: NonEmpty<DomainShape>,
    report_zero_numa_nodes: bool,
}

impl Topology for FakeTopology {
    fn number_of_pus(&self) -> usize {
        self.domains
            .iter()
            .flat_map(|cores| cores.iter())
            .sum()
    }

    fn number_of_numa_nodes(&self) -> usize {
        if self.report_zero_numa_nodes {
            0
        } else {
            self.domains.len()
        }
    }

    fn number_of_sockets(&self) -> usize {
        self.domains.len()
    }

    fn number_of_numa_node_cores(&self, domain: usize) -> usize {
        self.domains.get(domain).map_or(0, Vec::len)
    }

    fn number_of_core_pus(&self, core: usize) -> usize {
        self.domains
            .iter()
            .flat_map(|cores| cores.iter())
            .nth(core)
            .copied()
            .unwrap_or(0)
    }
}
