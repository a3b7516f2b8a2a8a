//! The partitioner's mirror of the machine topology.
//!
//! A three-level tree (NUMA domain, core, PU) materialized once at startup from the topology
//! provider, filtered down to the PUs the process affinity actually exposes. The partitioner
//! owns the authoritative copy and tracks per-PU occupancy in it; the handles returned to
//! callers are value snapshots that identify tree nodes by index, never by reference.

use crate::{NumaNodeId, PuId};

/// A processing unit in the topology mirror.
///
/// Identifies its owning core and domain by index into the mirror, and carries the occupancy
/// budget the affinity bindings allow for it.
#[derive(Clone, Debug)]
pub struct Pu {
    pub(crate) id: PuId,
    pub(crate) core_index: usize,
    pub(crate) domain_index: usize,

    /// How many logical workers this PU may host.
    pub(crate) thread_occupancy: usize,

    /// How many logical workers have been bound to this PU so far.
    pub(crate) thread_occupancy_count: usize,
}

impl Pu {
    /// The global ID of this processing unit.
    #[inline]
    #[must_use]
    pub fn id(&self) -> PuId {
        self.id
    }

    /// Index of the owning core within its NUMA domain.
    #[cfg_attr(test, mutants::skip)] // Trivial field accessor, do not waste time on mutation.
    #[inline]
    #[must_use]
    pub fn core_index(&self) -> usize {
        self.core_index
    }

    /// Index of the owning NUMA domain.
    #[cfg_attr(test, mutants::skip)] // Trivial field accessor, do not waste time on mutation.
    #[inline]
    #[must_use]
    pub fn domain_index(&self) -> usize {
        self.domain_index
    }

    /// How many logical workers this PU may host.
    #[inline]
    #[must_use]
    pub fn thread_occupancy(&self) -> usize {
        self.thread_occupancy
    }

    /// How many logical workers are currently bound to this PU.
    #[inline]
    #[must_use]
    pub fn thread_occupancy_count(&self) -> usize {
        self.thread_occupancy_count
    }
}

/// A core in the topology mirror: the PUs that share its execution resources.
#[derive(Clone, Debug)]
pub struct Core {
    pub(crate) index: usize,
    pub(crate) domain_index: usize,
    pub(crate) pus: Vec<Pu>,
}

impl Core {
    /// Index of this core within its NUMA domain.
    #[cfg_attr(test, mutants::skip)] // Trivial field accessor, do not waste time on mutation.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Index of the owning NUMA domain.
    #[cfg_attr(test, mutants::skip)] // Trivial field accessor, do not waste time on mutation.
    #[inline]
    #[must_use]
    pub fn domain_index(&self) -> usize {
        self.domain_index
    }

    /// The exposed PUs of this core, in index order.
    #[inline]
    #[must_use]
    pub fn pus(&self) -> &[Pu] {
        &self.pus
    }
}

/// A NUMA domain in the topology mirror: cores with uniform memory access among themselves.
#[derive(Clone, Debug)]
pub struct NumaDomain {
    pub(crate) id: NumaNodeId,
    pub(crate) cores: Vec<Core>,
}

impl NumaDomain {
    /// The domain's index in topology order.
    #[inline]
    #[must_use]
    pub fn id(&self) -> NumaNodeId {
        self.id
    }

    /// The surviving cores of this domain, in index order.
    #[inline]
    #[must_use]
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }
}

/// Looks up a PU by global ID in a mirror, returning mutable access for occupancy accounting.
pub(crate) fn find_pu_mut(domains: &mut [NumaDomain], pu: PuId) -> Option<&mut Pu> {
    domains
        .iter_mut()
        .flat_map(|domain| domain.cores.iter_mut())
        .flat_map(|core| core.pus.iter_mut())
        .find(|candidate| candidate.id == pu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_domain_mirror() -> Vec<NumaDomain> {
        // Domain 0 with one core of PUs {0, 1}, domain 1 with one core of PU {2}.
        vec![
            NumaDomain {
                id: 0,
                cores: vec![Core {
                    index: 0,
                    domain_index: 0,
                    pus: vec![
                        Pu {
                            id: 0,
                            core_index: 0,
                            domain_index: 0,
                            thread_occupancy: 1,
                            thread_occupancy_count: 0,
                        },
                        Pu {
                            id: 1,
                            core_index: 0,
                            domain_index: 0,
                            thread_occupancy: 1,
                            thread_occupancy_count: 0,
                        },
                    ],
                }],
            },
            NumaDomain {
                id: 1,
                cores: vec![Core {
                    index: 0,
                    domain_index: 1,
                    pus: vec![Pu {
                        id: 2,
                        core_index: 0,
                        domain_index: 1,
                        thread_occupancy: 1,
                        thread_occupancy_count: 0,
                    }],
                }],
            },
        ]
    }

    #[test]
    fn find_pu_mut_reaches_across_domains() {
        let mut mirror = two_domain_mirror();

        let pu = find_pu_mut(&mut mirror, 2).unwrap();
        assert_eq!(pu.domain_index(), 1);

        pu.thread_occupancy_count += 1;
        assert_eq!(mirror[1].cores()[0].pus()[0].thread_occupancy_count(), 1);
    }

    #[test]
    fn find_pu_mut_misses_unknown_id() {
        let mut mirror = two_domain_mirror();

        assert!(find_pu_mut(&mut mirror, 7).is_none());
    }
}
