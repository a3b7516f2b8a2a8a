//! Partitioning a machine's processing units into named thread pools.
//!
//! A task runtime that owns its worker threads has to decide, exactly once at startup, which
//! operating-system worker runs on which processing unit (PU) and which scheduler drives it.
//! This package performs that translation: it mirrors the hardware topology (NUMA domains,
//! cores, SMT siblings) filtered to the PUs the process may actually use, accepts declarative
//! pool descriptions, and produces the finalized worker-to-PU table plus per-pool construction
//! parameters the runtime commits to.
//!
//! The partitioner computes placements; it never pins threads or dispatches tasks. Applying
//! the produced affinity masks is the job of the thread-pool layer above.
//!
//! # Quick start
//!
//! Declare pools, bind resources, configure, then query:
//!
//! ```rust
//! use many_pools::fake::TopologyBuilder;
//! use many_pools::{MapConfig, Partitioner, PartitionerMode, SchedulingPolicy, TopologyFacade};
//! use new_zealand::nz;
//!
//! // A machine with one NUMA domain of four single-PU cores. Production code passes
//! // `TopologyFacade::real()` instead.
//! let topology = TopologyFacade::from_fake(TopologyBuilder::uniform(nz!(1), nz!(4), nz!(1)).build());
//! let config = MapConfig::new().with("hpx.os_threads", "4");
//!
//! let partitioner = Partitioner::new(PartitionerMode::DEFAULT, &config, topology).unwrap();
//!
//! // One dedicated pool for I/O work on the first PU; the rest goes to "default".
//! partitioner
//!     .create_thread_pool("io", SchedulingPolicy::LocalPriorityFifo, None, None)
//!     .unwrap();
//! let domains = partitioner.numa_domains();
//! partitioner
//!     .add_resource(&domains[0].cores()[0].pus()[0], "io", true, 1)
//!     .unwrap();
//!
//! partitioner.configure_pools().unwrap();
//!
//! // Worker IDs are numbered pool-major: default-pool workers first.
//! assert_eq!(partitioner.num_pools(), 2);
//! assert_eq!(partitioner.num_threads(), 4);
//! assert_eq!(partitioner.pu_num(0), 1);
//! assert_eq!(partitioner.pu_num(3), 0);
//! ```
//!
//! # Dynamic pools
//!
//! With [`PartitionerMode::ALLOW_DYNAMIC_POOLS`], PUs bound non-exclusively can be retracted
//! from a running pool and re-introduced later via
//! [`shrink_pool()`][Partitioner::shrink_pool] / [`expand_pool()`][Partitioner::expand_pool],
//! with the runtime notified through callbacks that run outside the partitioner lock.
//!
//! # Testing with fake topologies
//!
//! The [`fake`] module (behind the `test-util` feature) builds arbitrary
//! domain/core/PU shapes so partitioning logic can be tested without matching hardware.

mod affinity;
mod config;
mod error;
mod numa;
mod partitioner;
mod pool_data;
mod primitive_types;
mod pu_mask;
mod scheduling;
mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use config::{ConfigStore, MapConfig};
pub use error::Error;
pub(crate) use error::Result;
pub use numa::{Core, NumaDomain, Pu};
pub use partitioner::{Partitioner, PartitionerMode};
pub use pool_data::{BackgroundWork, PuPlacement, SchedulerFactory};
pub use primitive_types::*;
pub use pu_mask::PuMask;
pub use scheduling::{SchedulerMode, SchedulingPolicy};
pub use topology::{FallbackTopology, Topology, TopologyFacade};
