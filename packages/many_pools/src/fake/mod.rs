//! Simulated hardware topologies for testing.
//!
//! Code that partitions processing units is sensitive to the exact shape of the machine it
//! runs on, which makes it awkward to test against real hardware. This module provides a
//! [`TopologyBuilder`] that describes an arbitrary NUMA-domain/core/PU shape and produces a
//! [`FakeTopology`] that can stand in for the real machine.
//!
//! Available in this crate's own tests and to dependents via the `test-util` feature.
//!
//! # Example
//!
//! ```
//! use many_pools::fake::TopologyBuilder;
//! use many_pools::{Topology, TopologyFacade};
//! use new_zealand::nz;
//!
//! // 2 NUMA domains, each with 4 cores of 2 PUs.
//! let topology = TopologyBuilder::uniform(nz!(2), nz!(4), nz!(2)).build();
//! assert_eq!(topology.number_of_pus(), 16);
//!
//! let facade = TopologyFacade::from_fake(topology);
//! assert_eq!(facade.number_of_numa_nodes(), 2);
//! ```

mod topology_builder;

pub use topology_builder::*;
