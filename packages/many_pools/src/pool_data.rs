//! Per-pool construction records.
//!
//! One [`PoolData`] accumulates everything the runtime needs to instantiate a thread pool:
//! name, scheduling policy, mode flags, the optional factory and background-work hooks, and
//! the PU placement of every worker slot.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Error, PuId, PuMask, Result, SchedulerMode, SchedulingPolicy};

/// Builds a scheduler for a pool driven by [`SchedulingPolicy::UserDefined`].
///
/// Receives the pool's index; the product is opaque to this crate and is downcast by the
/// runtime layer that registered the factory.
pub type SchedulerFactory = Arc<dyn Fn(usize) -> Box<dyn Any + Send> + Send + Sync>;

/// Work a pool's scheduler performs between tasks. Receives the pool's index.
pub type BackgroundWork = Arc<dyn Fn(usize) + Send + Sync>;

/// Logical workers requested across all pools. Checked against the OS-thread budget on every
/// binding; reset when the partitioner is dropped.
static NUM_THREADS_OVERALL: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn num_threads_overall() -> usize {
    NUM_THREADS_OVERALL.load(Ordering::Relaxed)
}

pub(crate) fn reset_num_threads_overall() {
    NUM_THREADS_OVERALL.store(0, Ordering::Relaxed);
}

/// Placement of one worker slot ("virtual core") of a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PuPlacement {
    /// The PU this slot is bound to.
    pub pu: PuId,

    /// Whether the slot may never be dynamically detached from its pool.
    pub exclusive: bool,

    /// Whether a worker is currently running on this slot.
    pub assigned: bool,
}

pub(crate) struct PoolData {
    pub(crate) name: String,
    pub(crate) scheduling_policy: SchedulingPolicy,
    pub(crate) num_threads: usize,
    pub(crate) mode: SchedulerMode,
    pub(crate) scheduler_factory: Option<SchedulerFactory>,
    pub(crate) background_work: Option<BackgroundWork>,

    /// One mask per worker slot, each one-hot on the slot's PU.
    pub(crate) assigned_pus: Vec<PuMask>,

    /// One placement per worker slot; same length as `assigned_pus`.
    pub(crate) assigned_pu_nums: Vec<PuPlacement>,
}

impl PoolData {
    pub(crate) fn new(
        name: &str,
        scheduling_policy: SchedulingPolicy,
        mode: SchedulerMode,
        background_work: Option<BackgroundWork>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadParameter {
                operation: "PoolData::new",
                problem: "cannot instantiate a thread pool with an empty string as a name"
                    .to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            scheduling_policy,
            num_threads: 0,
            mode,
            scheduler_factory: None,
            background_work,
            assigned_pus: Vec::new(),
            assigned_pu_nums: Vec::new(),
        })
    }

    pub(crate) fn with_factory(
        name: &str,
        scheduler_factory: SchedulerFactory,
        mode: SchedulerMode,
        background_work: Option<BackgroundWork>,
    ) -> Result<Self> {
        let mut data = Self::new(
            name,
            SchedulingPolicy::UserDefined,
            mode,
            background_work,
        )?;
        data.scheduler_factory = Some(scheduler_factory);
        Ok(data)
    }

    /// Binds `num_threads` worker slots of this pool to `pu_index`.
    ///
    /// More than one thread per PU means deliberate over-subscription of that PU.
    pub(crate) fn add_resource(
        &mut self,
        pu_index: PuId,
        exclusive: bool,
        num_threads: usize,
        hardware_concurrency: usize,
    ) -> Result<()> {
        if pu_index as usize >= hardware_concurrency {
            return Err(Error::BadParameter {
                operation: "PoolData::add_resource",
                problem: format!(
                    "processing unit index {pu_index} out of bounds; this machine has \
                     {hardware_concurrency} processing units"
                ),
            });
        }

        self.num_threads += num_threads;
        NUM_THREADS_OVERALL.fetch_add(num_threads, Ordering::Relaxed);

        let pu_mask = PuMask::one_hot(hardware_concurrency, pu_index);

        // One mask and one placement per worker slot.
        for _ in 0..num_threads {
            self.assigned_pus.push(pu_mask.clone());
            self.assigned_pu_nums.push(PuPlacement {
                pu: pu_index,
                exclusive,
                assigned: false,
            });
        }

        Ok(())
    }

    /// Marks the worker at `virt_core` as running.
    pub(crate) fn assign_pu(&mut self, virt_core: usize) {
        debug_assert!(virt_core < self.assigned_pu_nums.len());
        debug_assert!(!self.assigned_pu_nums[virt_core].assigned);

        self.assigned_pu_nums[virt_core].assigned = true;
    }

    /// Marks the worker at `virt_core` as released.
    pub(crate) fn unassign_pu(&mut self, virt_core: usize) {
        debug_assert!(virt_core < self.assigned_pu_nums.len());
        debug_assert!(self.assigned_pu_nums[virt_core].assigned);

        self.assigned_pu_nums[virt_core].assigned = false;
    }

    pub(crate) fn pu_is_exclusive(&self, virt_core: usize) -> bool {
        self.assigned_pu_nums[virt_core].exclusive
    }

    pub(crate) fn pu_is_assigned(&self, virt_core: usize) -> bool {
        self.assigned_pu_nums[virt_core].assigned
    }

    /// Shifts every slot's PU by `offset`, wrapping at `hardware_concurrency`.
    pub(crate) fn assign_first_core(&mut self, offset: usize, hardware_concurrency: usize) {
        for slot in 0..self.num_threads {
            let placement = &mut self.assigned_pu_nums[slot];
            placement.pu = ((placement.pu as usize + offset) % hardware_concurrency) as PuId;

            self.assigned_pus[slot].clear();
            self.assigned_pus[slot].set(placement.pu);
        }
    }
}

impl fmt::Display for PoolData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[pool \"{}\"] with scheduler \"{}\" is running on PUs:",
            self.name, self.scheduling_policy
        )?;

        for mask in &self.assigned_pus {
            writeln!(f, "{mask}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for PoolData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name", &self.name)
            .field("scheduling_policy", &self.scheduling_policy)
            .field("num_threads", &self.num_threads)
            .field("mode", &self.mode)
            .field("assigned_pu_nums", &self.assigned_pu_nums)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::process_state_guard;

    #[test]
    fn empty_name_is_rejected() {
        let error = PoolData::new(
            "",
            SchedulingPolicy::Unspecified,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn factory_construction_forces_user_defined_policy() {
        let data = PoolData::with_factory(
            "custom",
            Arc::new(|index| Box::new(index) as Box<dyn Any + Send>),
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();

        assert_eq!(data.scheduling_policy, SchedulingPolicy::UserDefined);
        assert!(data.scheduler_factory.is_some());
    }

    #[test]
    fn add_resource_appends_one_slot_per_thread() {
        let _guard = process_state_guard();
        reset_num_threads_overall();

        let mut data = PoolData::new(
            "work",
            SchedulingPolicy::Local,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();

        data.add_resource(2, true, 3, 4).unwrap();

        assert_eq!(data.num_threads, 3);
        assert_eq!(data.assigned_pus.len(), 3);
        assert_eq!(data.assigned_pu_nums.len(), 3);
        assert!(data.assigned_pus.iter().all(|mask| mask.is_set(2)));
        assert!(data.pu_is_exclusive(1));
        assert!(!data.pu_is_assigned(1));
        assert_eq!(num_threads_overall(), 3);

        reset_num_threads_overall();
    }

    #[test]
    fn add_resource_rejects_out_of_bounds_pu() {
        let _guard = process_state_guard();

        let mut data = PoolData::new(
            "work",
            SchedulingPolicy::Local,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();

        let error = data.add_resource(4, true, 1, 4).unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
        assert_eq!(data.num_threads, 0);
    }

    #[test]
    fn assign_and_unassign_round_trip() {
        let _guard = process_state_guard();

        let mut data = PoolData::new(
            "work",
            SchedulingPolicy::Local,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();
        data.add_resource(0, false, 1, 2).unwrap();

        data.assign_pu(0);
        assert!(data.pu_is_assigned(0));

        data.unassign_pu(0);
        assert!(!data.pu_is_assigned(0));

        reset_num_threads_overall();
    }

    #[test]
    fn first_core_shift_wraps_and_rewrites_masks() {
        let _guard = process_state_guard();

        let mut data = PoolData::new(
            "work",
            SchedulingPolicy::Local,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();
        data.add_resource(2, true, 1, 4).unwrap();
        data.add_resource(3, true, 1, 4).unwrap();

        data.assign_first_core(2, 4);

        assert_eq!(data.assigned_pu_nums[0].pu, 0);
        assert_eq!(data.assigned_pu_nums[1].pu, 1);
        assert!(data.assigned_pus[0].is_set(0));
        assert!(!data.assigned_pus[0].is_set(2));

        reset_num_threads_overall();
    }

    #[test]
    fn display_names_pool_and_scheduler() {
        let _guard = process_state_guard();

        let mut data = PoolData::new(
            "io",
            SchedulingPolicy::LocalPriorityFifo,
            SchedulerMode::DEFAULT_MODE,
            None,
        )
        .unwrap();
        data.add_resource(0, true, 1, 4).unwrap();

        let rendered = data.to_string();
        assert!(rendered.contains("[pool \"io\"]"));
        assert!(rendered.contains("local-priority-fifo"));

        reset_num_threads_overall();
    }
}
