//! The affinity map: which PU does worker `k` run on?
//!
//! At construction the map describes the provisional worker placement derived from the
//! configured offset and step, numbering workers in order of consecutive PU occupation. Once
//! pools are laid out, the partitioner rewrites the map pool-major so that worker IDs match the
//! order in which the runtime instantiates pool threads.

use crate::config::{ConfigStore, entry_as};
use crate::{Error, PuId, PuMask, Result, Topology};

/// The finalized worker-to-PU table consumed by the runtime's thread-pool layer.
///
/// Owned by the partitioner; all access goes through the partitioner's query surface.
#[derive(Clone, Debug)]
pub(crate) struct AffinityData {
    num_threads: usize,
    pu_offset: usize,
    pu_step: usize,

    /// Affinity binding description, passed through to the thread-pool layer uninterpreted.
    affinity: String,

    /// NUMA sensitivity level, passed through uninterpreted.
    numa_sensitive: usize,

    pu_nums: Vec<PuId>,
    affinity_masks: Vec<PuMask>,

    /// Distinct PUs the initial placement occupies; frozen at construction.
    num_pus_needed: usize,

    hardware_concurrency: usize,
}

impl AffinityData {
    /// Builds the provisional placement from configuration.
    ///
    /// Worker `i` is provisionally placed on PU `(pu_offset + i * pu_step) % hardware_concurrency`.
    pub(crate) fn from_config<C>(config: &C, topology: &impl Topology) -> Result<Self>
    where
        C: ConfigStore + ?Sized,
    {
        let hardware_concurrency = topology.number_of_pus();

        let num_threads = entry_as(config, "hpx.os_threads", 0_usize);
        if num_threads == 0 {
            return Err(Error::BadParameter {
                operation: "AffinityData::from_config",
                problem: "configuration entry 'hpx.os_threads' must be present and > 0"
                    .to_string(),
            });
        }

        let pu_step = entry_as(config, "hpx.pu_step", 1_usize);
        if pu_step == 0 {
            return Err(Error::BadParameter {
                operation: "AffinityData::from_config",
                problem: "configuration entry 'hpx.pu_step' must be > 0".to_string(),
            });
        }

        let pu_offset = entry_as(config, "hpx.pu_offset", 0_usize);
        let affinity = config.get("hpx.affinity").unwrap_or_else(|| "pu".to_string());
        let numa_sensitive = entry_as(config, "hpx.numa_sensitive", 0_usize);

        let pu_nums: Vec<PuId> = (0..num_threads)
            .map(|worker| {
                let pu = (pu_offset + worker * pu_step) % hardware_concurrency;
                pu as PuId
            })
            .collect();

        let affinity_masks = pu_nums
            .iter()
            .map(|pu| PuMask::one_hot(hardware_concurrency, *pu))
            .collect();

        let mut distinct = pu_nums.clone();
        distinct.sort_unstable();
        distinct.dedup();
        let num_pus_needed = distinct.len();

        Ok(Self {
            num_threads,
            pu_offset,
            pu_step,
            affinity,
            numa_sensitive,
            pu_nums,
            affinity_masks,
            num_pus_needed,
            hardware_concurrency,
        })
    }

    /// The PU hosting worker `worker`.
    pub(crate) fn get_pu_num(&self, worker: usize) -> PuId {
        self.pu_nums[worker]
    }

    /// The affinity mask of worker `worker`.
    pub(crate) fn get_pu_mask(&self, worker: usize) -> PuMask {
        self.affinity_masks[worker].clone()
    }

    /// The set of PUs the process occupies.
    ///
    /// With affinity disabled every PU is exposed as itself, so `pu` is reported back one-hot;
    /// otherwise the union of all worker masks is returned.
    pub(crate) fn get_used_pus_mask(&self, pu: PuId) -> PuMask {
        if self.affinity == "none" {
            return PuMask::one_hot(self.hardware_concurrency, pu);
        }

        let mut used = PuMask::new(self.hardware_concurrency);
        for mask in &self.affinity_masks {
            used.union_with(mask);
        }
        used
    }

    /// How many logical workers are placed on `pu`.
    pub(crate) fn get_thread_occupancy(&self, pu: PuId) -> usize {
        self.pu_nums.iter().filter(|num| **num == pu).count()
    }

    /// Distinct PUs needed by the initial placement.
    pub(crate) fn get_num_pus_needed(&self) -> usize {
        self.num_pus_needed
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// NUMA sensitivity level, for the thread-pool layer.
    pub(crate) fn numa_sensitive(&self) -> usize {
        self.numa_sensitive
    }

    /// Affinity binding description, for the thread-pool layer.
    pub(crate) fn affinity(&self) -> &str {
        &self.affinity
    }

    pub(crate) fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub(crate) fn set_pu_nums(&mut self, pu_nums: Vec<PuId>) {
        self.pu_nums = pu_nums;
    }

    pub(crate) fn set_affinity_masks(&mut self, affinity_masks: Vec<PuMask>) {
        self.affinity_masks = affinity_masks;
    }
}
