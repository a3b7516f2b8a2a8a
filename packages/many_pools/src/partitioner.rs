//! The resource partitioner.
//!
//! Created exactly once during process startup, the partitioner translates the machine
//! topology and the embedder's pool declarations into the concrete worker-to-PU layout the
//! runtime commits to. After [`configure_pools()`][Partitioner::configure_pools] it serves
//! placement queries and the narrow online-reconfiguration protocol
//! ([`assign_pu`][Partitioner::assign_pu] / [`unassign_pu`][Partitioner::unassign_pu] /
//! [`shrink_pool`][Partitioner::shrink_pool] / [`expand_pool`][Partitioner::expand_pool]).

use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::affinity::AffinityData;
use crate::config::{ConfigStore, entry_as};
use crate::numa::find_pu_mut;
use crate::pool_data::{self, PoolData};
use crate::scheduling::resolve_policy;
use crate::{
    BackgroundWork, Core, Error, NumaDomain, Pu, PuId, PuMask, PuPlacement, Result,
    SchedulerFactory, SchedulerMode, SchedulingPolicy, Topology, TopologyFacade,
};

/// Behavior flags of the partitioner itself. Combine flags with `|`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PartitionerMode(u32);

impl PartitionerMode {
    /// No flags set: every binding is exclusive and the OS-thread budget is enforced
    /// strictly.
    pub const DEFAULT: Self = Self(0);

    /// More logical workers may be bound than the OS-thread budget covers, and a single PU
    /// may host more workers than its occupancy budget.
    pub const ALLOW_OVERSUBSCRIPTION: Self = Self(0x1);

    /// Pools may retract and re-introduce non-exclusively bound PUs while running.
    pub const ALLOW_DYNAMIC_POOLS: Self = Self(0x2);

    /// Whether every flag of `other` is set in this mode.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PartitionerMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Live partitioner instances; at most one may exist per process.
static INSTANCE_COUNT: AtomicIsize = AtomicIsize::new(0);

/// Name under which the index-0 pool is always addressable, regardless of renames.
const DEFAULT_POOL_NAME: &str = "default";

/// Everything guarded by the partitioner lock.
struct PartitionerState {
    /// Index 0 is always the default pool.
    pools: Vec<PoolData>,

    /// The topology mirror; authoritative for per-PU occupancy counts.
    numa_domains: Vec<NumaDomain>,

    affinity: AffinityData,

    /// The first core the layout was shifted to; `None` until the first
    /// [`assign_cores()`][Partitioner::assign_cores].
    first_core: Option<usize>,

    /// Cached number of PUs the initial placement needs.
    pus_needed: Option<usize>,

    /// Seeded from `hpx.first_used_core`; owned here because the config store is read-only.
    first_used_core: usize,
}

/// Partitions the machine's processing units into named thread pools.
///
/// # Lifecycle
///
/// A partitioner is created once, populated through
/// [`create_thread_pool()`][Self::create_thread_pool] /
/// [`add_resource()`][Self::add_resource] / [`set_scheduler()`][Self::set_scheduler],
/// finalized with [`configure_pools()`][Self::configure_pools], and then queried by the
/// runtime for the lifetime of the process. Creating a second partitioner while one is alive
/// fails with [`Error::InvalidStatus`].
///
/// # Example
///
/// ```
/// use many_pools::fake::TopologyBuilder;
/// use many_pools::{
///     MapConfig, Partitioner, PartitionerMode, SchedulingPolicy, TopologyFacade,
/// };
/// use new_zealand::nz;
///
/// // One NUMA domain with four single-PU cores.
/// let topology = TopologyFacade::from_fake(TopologyBuilder::uniform(nz!(1), nz!(4), nz!(1)).build());
/// let config = MapConfig::new().with("hpx.os_threads", "4");
///
/// let partitioner = Partitioner::new(PartitionerMode::DEFAULT, &config, topology).unwrap();
///
/// // Dedicate the first PU to an "io" pool; everything else falls to "default".
/// partitioner
///     .create_thread_pool("io", SchedulingPolicy::LocalPriorityFifo, None, None)
///     .unwrap();
/// let domains = partitioner.numa_domains();
/// partitioner
///     .add_resource(&domains[0].cores()[0].pus()[0], "io", true, 1)
///     .unwrap();
///
/// partitioner.configure_pools().unwrap();
///
/// assert_eq!(partitioner.num_pools(), 2);
/// assert_eq!(partitioner.num_threads(), 4);
/// ```
pub struct Partitioner {
    state: Mutex<PartitionerState>,
    mode: PartitionerMode,
    topology: TopologyFacade,
    hardware_concurrency: usize,

    /// The OS-thread budget from `hpx.os_threads`.
    os_threads: usize,

    /// The scheduler string from `hpx.scheduler`, resolved during configuration.
    scheduler_entry: String,

    default_scheduler_mode: SchedulerMode,

    /// Flipped at the end of [`configure_pools()`][Self::configure_pools]; placement queries
    /// answer from the affinity map once set.
    is_initialized: AtomicBool,
}

impl Partitioner {
    /// Creates the process's resource partitioner.
    ///
    /// Reads `hpx.os_threads` (required), `hpx.default_scheduler_mode`, `hpx.scheduler` and
    /// the affinity pass-through entries from `config`, mirrors the exposed part of
    /// `topology`, and creates the `"default"` pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] when a partitioner already exists or the topology is
    /// inconsistent with the affinity bindings, and [`Error::BadParameter`] for unusable
    /// configuration values.
    pub fn new<C>(
        mode: PartitionerMode,
        config: &C,
        topology: TopologyFacade,
    ) -> Result<Self>
    where
        C: ConfigStore + ?Sized,
    {
        if INSTANCE_COUNT.fetch_add(1, Ordering::SeqCst) > 0 {
            INSTANCE_COUNT.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::InvalidStatus {
                operation: "Partitioner::new",
                problem: "cannot instantiate more than one resource partitioner".to_string(),
            });
        }

        let result = Self::build(mode, config, topology);
        if result.is_err() {
            // The instance slot is only consumed by a partitioner that will eventually drop.
            INSTANCE_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn build<C>(mode: PartitionerMode, config: &C, topology: TopologyFacade) -> Result<Self>
    where
        C: ConfigStore + ?Sized,
    {
        let hardware_concurrency = topology.number_of_pus();
        if hardware_concurrency == 0 {
            return Err(Error::InvalidStatus {
                operation: "Partitioner::new",
                problem: "the topology provider reports zero processing units".to_string(),
            });
        }

        let default_scheduler_mode = match config.get("hpx.default_scheduler_mode") {
            Some(raw) => {
                let bits = raw.parse::<u32>().unwrap_or(0);
                debug_assert!(
                    SchedulerMode::from_bits(bits).is_some(),
                    "'hpx.default_scheduler_mode' contains unknown scheduler modes"
                );
                SchedulerMode::from_bits_truncate(bits)
            }
            None => SchedulerMode::DEFAULT_MODE,
        };

        let affinity = AffinityData::from_config(config, &topology)?;
        let os_threads = affinity.num_threads();

        let scheduler_entry = config
            .get("hpx.scheduler")
            .unwrap_or_else(|| "local-priority-fifo".to_string());

        let default_pool = PoolData::new(
            DEFAULT_POOL_NAME,
            SchedulingPolicy::Unspecified,
            default_scheduler_mode,
            None,
        )?;

        let mut state = PartitionerState {
            pools: vec![default_pool],
            numa_domains: Vec::new(),
            affinity,
            first_core: None,
            pus_needed: None,
            first_used_core: entry_as(config, "hpx.first_used_core", 0_usize),
        };

        Self::fill_topology_vectors(&topology, hardware_concurrency, &mut state)?;

        // Seed the layout at core 0 and cache the placement need, as assign_cores(0) would.
        state.first_core = Some(0);
        Self::reconfigure_affinities_locked(&mut state);
        Self::threads_needed_locked(&mut state);

        Ok(Self {
            state: Mutex::new(state),
            mode,
            topology,
            hardware_concurrency,
            os_threads,
            scheduler_entry,
            default_scheduler_mode,
            is_initialized: AtomicBool::new(false),
        })
    }

    /// The partitioner's behavior flags.
    #[cfg_attr(test, mutants::skip)] // Trivial field accessor, do not waste time on mutation.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> PartitionerMode {
        self.mode
    }

    /// Whether [`configure_pools()`][Self::configure_pools] has completed.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Acquire)
    }

    /// Whether `pu` lies within the process's exposed PU set.
    fn pu_exposed(affinity: &AffinityData, hardware_concurrency: usize, pu: usize) -> bool {
        if pu >= hardware_concurrency {
            return false;
        }

        let pu = pu as PuId;
        let one_hot = PuMask::one_hot(hardware_concurrency, pu);
        affinity.get_used_pus_mask(pu).overlaps(&one_hot)
    }

    /// Materializes the topology mirror, skipping non-exposed PUs and dropping cores and
    /// domains that end up empty.
    fn fill_topology_vectors(
        topology: &TopologyFacade,
        hardware_concurrency: usize,
        state: &mut PartitionerState,
    ) -> Result<()> {
        let mut num_numa_nodes = topology.number_of_numa_nodes();
        if num_numa_nodes == 0 {
            num_numa_nodes = topology.number_of_sockets();
        }

        let mut domains = Vec::with_capacity(num_numa_nodes);
        let mut pid: usize = 0;
        let mut global_core: usize = 0;

        for domain_index in 0..num_numa_nodes {
            let mut cores = Vec::new();

            for core_index in 0..topology.number_of_numa_node_cores(domain_index) {
                let mut pus = Vec::new();

                for _ in 0..topology.number_of_core_pus(global_core) {
                    if Self::pu_exposed(&state.affinity, hardware_concurrency, pid) {
                        let thread_occupancy = state.affinity.get_thread_occupancy(pid as PuId);
                        if thread_occupancy == 0 {
                            return Err(Error::InvalidStatus {
                                operation: "Partitioner::fill_topology_vectors",
                                problem: format!("PU #{pid} has thread occupancy 0"),
                            });
                        }

                        pus.push(Pu {
                            id: pid as PuId,
                            core_index,
                            domain_index,
                            thread_occupancy,
                            thread_occupancy_count: 0,
                        });
                    }
                    pid += 1;
                }

                global_core += 1;

                if !pus.is_empty() {
                    cores.push(Core {
                        index: core_index,
                        domain_index,
                        pus,
                    });
                }
            }

            if !cores.is_empty() {
                domains.push(NumaDomain {
                    id: domain_index as crate::NumaNodeId,
                    cores,
                });
            }
        }

        state.numa_domains = domains;
        Ok(())
    }

    /// A snapshot of the topology mirror, for selecting resources to bind to pools.
    ///
    /// Occupancy counts in the snapshot reflect the moment of the call.
    #[must_use]
    pub fn numa_domains(&self) -> Vec<NumaDomain> {
        self.state.lock().numa_domains.clone()
    }

    /// Creates a new thread pool driven by `policy`.
    ///
    /// A `None` mode inherits the process default from `hpx.default_scheduler_mode`. Creating
    /// a pool under the default pool's name replaces the index-0 entry in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the name is empty or already taken.
    pub fn create_thread_pool(
        &self,
        pool_name: &str,
        policy: SchedulingPolicy,
        mode: Option<SchedulerMode>,
        background_work: Option<BackgroundWork>,
    ) -> Result<()> {
        let mode = mode.unwrap_or(self.default_scheduler_mode);
        let data = PoolData::new(pool_name, policy, mode, background_work)?;
        self.insert_pool(data)
    }

    /// Creates a new thread pool driven by a user-supplied scheduler factory.
    ///
    /// The pool's policy is [`SchedulingPolicy::UserDefined`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the name is empty or already taken.
    pub fn create_thread_pool_with_factory(
        &self,
        pool_name: &str,
        scheduler_factory: SchedulerFactory,
        background_work: Option<BackgroundWork>,
    ) -> Result<()> {
        let data = PoolData::with_factory(
            pool_name,
            scheduler_factory,
            self.default_scheduler_mode,
            background_work,
        )?;
        self.insert_pool(data)
    }

    fn insert_pool(&self, mut data: PoolData) -> Result<()> {
        let mut state = self.state.lock();

        // The default pool may be re-declared; it keeps index 0 and its current name.
        if data.name == DEFAULT_POOL_NAME || data.name == state.pools[0].name {
            data.name = state.pools[0].name.clone();
            state.pools[0] = data;
            return Ok(());
        }

        if state.pools.iter().skip(1).any(|pool| pool.name == data.name) {
            return Err(Error::BadParameter {
                operation: "Partitioner::create_thread_pool",
                problem: format!("there already exists a pool named '{}'", data.name),
            });
        }

        state.pools.push(data);
        Ok(())
    }

    /// Sets the scheduling policy of an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist.
    pub fn set_scheduler(&self, policy: SchedulingPolicy, pool_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::pool_by_name_mut(&mut state, pool_name)?.scheduling_policy = policy;
        Ok(())
    }

    /// Binds `num_threads` logical workers on `pu` to the named pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for an unknown pool, an out-of-range PU, or a
    /// non-exclusive binding without [`PartitionerMode::ALLOW_DYNAMIC_POOLS`], and
    /// [`Error::Runtime`] when the PU's occupancy budget or the process's OS-thread budget
    /// would be exceeded.
    pub fn add_resource(
        &self,
        pu: &Pu,
        pool_name: &str,
        exclusive: bool,
        num_threads: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.add_resource_locked(&mut state, pu.id(), pool_name, exclusive, num_threads)
    }

    /// Binds each of `pus` to the named pool, one worker per PU.
    pub fn add_resource_pus(&self, pus: &[Pu], pool_name: &str, exclusive: bool) -> Result<()> {
        for pu in pus {
            self.add_resource(pu, pool_name, exclusive, 1)?;
        }
        Ok(())
    }

    /// Binds every PU of `core` to the named pool.
    pub fn add_resource_core(&self, core: &Core, pool_name: &str, exclusive: bool) -> Result<()> {
        self.add_resource_pus(core.pus(), pool_name, exclusive)
    }

    /// Binds every PU of each of `cores` to the named pool.
    pub fn add_resource_cores(
        &self,
        cores: &[Core],
        pool_name: &str,
        exclusive: bool,
    ) -> Result<()> {
        for core in cores {
            self.add_resource_core(core, pool_name, exclusive)?;
        }
        Ok(())
    }

    /// Binds every PU of `domain` to the named pool.
    pub fn add_resource_domain(
        &self,
        domain: &NumaDomain,
        pool_name: &str,
        exclusive: bool,
    ) -> Result<()> {
        self.add_resource_cores(domain.cores(), pool_name, exclusive)
    }

    /// Binds every PU of each of `domains` to the named pool.
    pub fn add_resource_domains(
        &self,
        domains: &[NumaDomain],
        pool_name: &str,
        exclusive: bool,
    ) -> Result<()> {
        for domain in domains {
            self.add_resource_domain(domain, pool_name, exclusive)?;
        }
        Ok(())
    }

    fn add_resource_locked(
        &self,
        state: &mut PartitionerState,
        pu: PuId,
        pool_name: &str,
        exclusive: bool,
        num_threads: usize,
    ) -> Result<()> {
        if !exclusive && !self.mode.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS) {
            return Err(Error::BadParameter {
                operation: "Partitioner::add_resource",
                problem: "dynamic pools have not been enabled for this partitioner".to_string(),
            });
        }

        if pu as usize >= self.hardware_concurrency {
            return Err(Error::BadParameter {
                operation: "Partitioner::add_resource",
                problem: format!(
                    "processing unit index {pu} out of bounds; this machine has {} processing \
                     units",
                    self.hardware_concurrency
                ),
            });
        }

        let pool_index = Self::pool_index_by_name(state, pool_name)?;

        let Some(mirror_pu) = find_pu_mut(&mut state.numa_domains, pu) else {
            return Err(Error::BadParameter {
                operation: "Partitioner::add_resource",
                problem: format!("PU #{pu} is not exposed to this process"),
            });
        };

        if self.mode.contains(PartitionerMode::ALLOW_OVERSUBSCRIPTION) {
            state.pools[pool_index].add_resource(
                pu,
                exclusive,
                num_threads,
                self.hardware_concurrency,
            )?;
            mirror_pu.thread_occupancy_count += 1;
            return Ok(());
        }

        if mirror_pu.thread_occupancy_count == 0 {
            state.pools[pool_index].add_resource(
                pu,
                exclusive,
                num_threads,
                self.hardware_concurrency,
            )?;
            mirror_pu.thread_occupancy_count += 1;

            // The total never exceeds what the configuration provides OS threads for.
            let overall = pool_data::num_threads_overall();
            if overall > self.os_threads {
                return Err(Error::Runtime {
                    operation: "Partitioner::add_resource",
                    problem: format!(
                        "creation of {overall} threads requested, but only {} provided by the \
                         configuration",
                        self.os_threads
                    ),
                });
            }

            Ok(())
        } else {
            Err(Error::Runtime {
                operation: "Partitioner::add_resource",
                problem: format!(
                    "PU #{pu} can be assigned only {} threads according to the affinity bindings",
                    mirror_pu.thread_occupancy
                ),
            })
        }
    }

    /// Finalizes the pool layout: fills unbound PUs into the default pool, resolves
    /// unspecified scheduling policies, and rewrites the affinity map pool-major.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the default pool ends up without threads or any other
    /// pool is empty of resources, and [`Error::CommandLine`] when the configured scheduler
    /// string is unknown.
    pub fn configure_pools(&self) -> Result<()> {
        self.setup_pools()?;
        self.setup_schedulers()?;

        {
            let mut state = self.state.lock();
            debug!(
                num_threads = state.pools.iter().map(|pool| pool.num_threads).sum::<usize>(),
                "rewriting affinity map pool-major"
            );
            Self::reconfigure_affinities_locked(&mut state);
        }

        self.is_initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn setup_pools(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let default_pool_name = state.pools[0].name.clone();

        // Assign all free resources to the default pool. The first PU is always bound
        // exclusively so the default pool cannot lose every worker; the rest are bound
        // non-exclusively iff dynamic pools are enabled.
        let free_pus: Vec<PuId> = state
            .numa_domains
            .iter()
            .flat_map(|domain| domain.cores.iter())
            .flat_map(|core| core.pus.iter())
            .filter(|pu| pu.thread_occupancy_count == 0)
            .map(|pu| pu.id)
            .collect();

        debug!(
            free_pus = free_pus.len(),
            pool = %default_pool_name,
            "filling unbound processing units into the default pool"
        );

        let mut first = true;
        for pu in free_pus {
            let exclusive =
                first || !self.mode.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS);
            self.add_resource_locked(state, pu, &default_pool_name, exclusive, 1)?;
            first = false;
        }

        if state.pools[0].num_threads == 0 {
            return Err(Error::InvalidStatus {
                operation: "Partitioner::setup_pools",
                problem: format!(
                    "default pool \"{default_pool_name}\" has no threads assigned; please rerun \
                     with --hpx:threads=X and check the pool thread assignment"
                ),
            });
        }

        // No pool may be empty of resources.
        if Self::check_empty_pools_locked(state) {
            let dump = Self::format_pools_locked(state);
            error!(pools = %dump, "pools empty of resources are not allowed");
            return Err(Error::Runtime {
                operation: "Partitioner::setup_pools",
                problem: "pools empty of resources are not allowed; please re-run this \
                          application with allow-empty-pool-policy (not implemented yet)"
                    .to_string(),
            });
        }

        Ok(())
    }

    fn setup_schedulers(&self) -> Result<()> {
        let default_scheduler = resolve_policy(&self.scheduler_entry)?;

        debug!(scheduler = %default_scheduler, "resolving unspecified pool schedulers");

        let mut state = self.state.lock();
        for pool in &mut state.pools {
            if pool.scheduling_policy == SchedulingPolicy::Unspecified {
                pool.scheduling_policy = default_scheduler;
            }
        }

        Ok(())
    }

    /// Rewrites the affinity map so worker IDs are numbered pool-major: all default-pool
    /// workers first, then pool 1's, and so on in declaration order.
    fn reconfigure_affinities_locked(state: &mut PartitionerState) {
        let mut pu_nums = Vec::new();
        let mut affinity_masks = Vec::new();

        for pool in &state.pools {
            for mask in &pool.assigned_pus {
                affinity_masks.push(mask.clone());
            }
            for placement in &pool.assigned_pu_nums {
                pu_nums.push(placement.pu);
            }
        }

        state.affinity.set_num_threads(pu_nums.len());
        state.affinity.set_pu_nums(pu_nums);
        state.affinity.set_affinity_masks(affinity_masks);
    }

    /// Whether any pool holds no worker slot or an all-zero placement mask.
    fn check_empty_pools_locked(state: &PartitionerState) -> bool {
        state.pools.iter().any(|pool| {
            pool.assigned_pus.is_empty() || pool.assigned_pus.iter().any(|mask| !mask.any())
        })
    }

    /// Shifts the whole layout so it starts at `first_core` and returns the number of PUs the
    /// placement needs.
    ///
    /// Calling this again with the same core is a no-op.
    pub fn assign_cores(&self, first_core: usize) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.first_core != Some(first_core) {
            let pus_per_core = self.topology.number_of_core_pus(first_core);
            let delta = match state.first_core {
                Some(cached) => first_core as isize - cached as isize,
                None => first_core as isize,
            };

            let offset = (delta * pus_per_core as isize)
                .rem_euclid(self.hardware_concurrency as isize) as usize;

            if offset != 0 {
                for pool in &mut state.pools {
                    pool.assign_first_core(offset, self.hardware_concurrency);
                }
            }

            state.first_core = Some(first_core);
            Self::reconfigure_affinities_locked(state);
        }

        Self::threads_needed_locked(state)
    }

    /// The number of PUs the initial placement occupies.
    #[must_use]
    pub fn threads_needed(&self) -> usize {
        Self::threads_needed_locked(&mut self.state.lock())
    }

    fn threads_needed_locked(state: &mut PartitionerState) -> usize {
        *state
            .pus_needed
            .get_or_insert_with(|| state.affinity.get_num_pus_needed())
    }

    /// Marks the worker at `virt_core` of the named pool as running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist.
    pub fn assign_pu(&self, pool_name: &str, virt_core: usize) -> Result<()> {
        let mut state = self.state.lock();
        Self::pool_by_name_mut(&mut state, pool_name)?.assign_pu(virt_core);
        Ok(())
    }

    /// Marks the worker at `virt_core` of the named pool as released.
    ///
    /// Best-effort: when the partitioner lock is contended the call is a no-op, which permits
    /// calls from inside scheduler callbacks without deadlocking. If contended, the caller
    /// assumes the release already happened or will happen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist (only detectable when the
    /// lock was acquired).
    pub fn unassign_pu(&self, pool_name: &str, virt_core: usize) -> Result<()> {
        if let Some(mut state) = self.state.try_lock() {
            Self::pool_by_name_mut(&mut state, pool_name)?.unassign_pu(virt_core);
        }
        Ok(())
    }

    /// Retracts every non-exclusive, currently assigned worker slot of the named pool,
    /// invoking `remove_callback` with each slot's virtual-core index in enumeration order.
    ///
    /// The callback runs outside the partitioner lock. Returns how many slots were retracted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when dynamic pools are not enabled, the pool does not
    /// exist, or the pool holds no non-exclusive slots at all.
    pub fn shrink_pool(
        &self,
        pool_name: &str,
        mut remove_callback: impl FnMut(usize),
    ) -> Result<usize> {
        let virt_cores = self.collect_dynamic_slots(pool_name, "Partitioner::shrink_pool", true)?;

        for virt_core in &virt_cores {
            remove_callback(*virt_core);
        }

        Ok(virt_cores.len())
    }

    /// Re-introduces every non-exclusive, currently unassigned worker slot of the named pool,
    /// invoking `add_callback` with each slot's virtual-core index in enumeration order.
    ///
    /// The callback runs outside the partitioner lock. Returns how many slots were offered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when dynamic pools are not enabled, the pool does not
    /// exist, or the pool holds no non-exclusive slots at all.
    pub fn expand_pool(
        &self,
        pool_name: &str,
        mut add_callback: impl FnMut(usize),
    ) -> Result<usize> {
        let virt_cores = self.collect_dynamic_slots(pool_name, "Partitioner::expand_pool", false)?;

        for virt_core in &virt_cores {
            add_callback(*virt_core);
        }

        Ok(virt_cores.len())
    }

    /// Collects the non-exclusive slots of a pool whose assigned flag equals `assigned`,
    /// releasing the lock before returning.
    fn collect_dynamic_slots(
        &self,
        pool_name: &str,
        operation: &'static str,
        assigned: bool,
    ) -> Result<Vec<usize>> {
        if !self.mode.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS) {
            return Err(Error::BadParameter {
                operation,
                problem: "dynamic pools have not been enabled for the partitioner".to_string(),
            });
        }

        let mut virt_cores = Vec::new();
        let mut has_non_exclusive_pus = false;

        {
            let state = self.state.lock();
            let data = Self::pool_by_name(&state, pool_name)?;

            for virt_core in 0..data.num_threads {
                if !data.pu_is_exclusive(virt_core) {
                    has_non_exclusive_pus = true;
                    if data.pu_is_assigned(virt_core) == assigned {
                        virt_cores.push(virt_core);
                    }
                }
            }
        }

        if !has_non_exclusive_pus {
            return Err(Error::BadParameter {
                operation,
                problem: format!("pool '{pool_name}' has no non-exclusive pus associated"),
            });
        }

        Ok(virt_cores)
    }

    /// The total number of logical workers across all pools.
    ///
    /// After configuration this equals the OS-thread budget unless oversubscription is
    /// enabled.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        let state = self.state.lock();
        let num_threads = state.pools.iter().map(|pool| pool.num_threads).sum();

        debug_assert!(
            self.mode.contains(PartitionerMode::ALLOW_OVERSUBSCRIPTION)
                || num_threads == self.os_threads
        );

        num_threads
    }

    /// The number of pools, including the default pool.
    #[must_use]
    pub fn num_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// The number of logical workers of the named pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist.
    pub fn num_threads_in(&self, pool_name: &str) -> Result<usize> {
        let state = self.state.lock();
        Ok(Self::pool_by_name(&state, pool_name)?.num_threads)
    }

    /// The number of logical workers of the pool at `pool_index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the index is out of bounds.
    pub fn num_threads_at(&self, pool_index: usize) -> Result<usize> {
        let state = self.state.lock();
        Ok(Self::pool_at(&state, pool_index)?.num_threads)
    }

    /// The scheduler-mode flags of the pool at `pool_index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the index is out of bounds.
    pub fn scheduler_mode(&self, pool_index: usize) -> Result<SchedulerMode> {
        let state = self.state.lock();
        Ok(Self::pool_at(&state, pool_index)?.mode)
    }

    /// The background-work hook of the pool at `pool_index`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the index is out of bounds.
    pub fn background_work(&self, pool_index: usize) -> Result<Option<BackgroundWork>> {
        let state = self.state.lock();
        Ok(Self::pool_at(&state, pool_index)?.background_work.clone())
    }

    /// The scheduler factory of the pool at `pool_index`, if any.
    ///
    /// Present exactly when the pool's policy is [`SchedulingPolicy::UserDefined`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the index is out of bounds.
    pub fn pool_creator(&self, pool_index: usize) -> Result<Option<SchedulerFactory>> {
        let state = self.state.lock();
        Ok(Self::pool_at(&state, pool_index)?.scheduler_factory.clone())
    }

    /// The name of the pool at `pool_index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the index is out of bounds.
    pub fn pool_name(&self, pool_index: usize) -> Result<String> {
        let state = self.state.lock();
        Ok(Self::pool_at(&state, pool_index)?.name.clone())
    }

    /// The index of the named pool. `"default"` always resolves to 0, even if the default
    /// pool has been renamed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist.
    pub fn pool_index(&self, pool_name: &str) -> Result<usize> {
        if pool_name == DEFAULT_POOL_NAME {
            return Ok(0);
        }

        let state = self.state.lock();
        Self::pool_index_by_name(&state, pool_name)
    }

    /// The scheduling policy the named pool is to be driven by.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist or its policy is still
    /// [`SchedulingPolicy::Unspecified`] (the configuration driver resolves that).
    pub fn which_scheduler(&self, pool_name: &str) -> Result<SchedulingPolicy> {
        let state = self.state.lock();
        let policy = Self::pool_by_name(&state, pool_name)?.scheduling_policy;

        if policy == SchedulingPolicy::Unspecified {
            return Err(Error::BadParameter {
                operation: "Partitioner::which_scheduler",
                problem: format!(
                    "thread pool '{pool_name}' cannot be instantiated with unspecified scheduler \
                     type"
                ),
            });
        }

        Ok(policy)
    }

    /// The placement of the worker at `virt_core` of the named pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] when the pool does not exist or the slot index is out
    /// of bounds.
    pub fn placement(&self, pool_name: &str, virt_core: usize) -> Result<PuPlacement> {
        let state = self.state.lock();
        let data = Self::pool_by_name(&state, pool_name)?;

        data.assigned_pu_nums
            .get(virt_core)
            .copied()
            .ok_or_else(|| Error::BadParameter {
                operation: "Partitioner::placement",
                problem: format!(
                    "pool '{pool_name}' has only {} worker slots",
                    data.num_threads
                ),
            })
    }

    /// The PU hosting worker `worker`.
    ///
    /// Before initialization this is the identity mapping, which keeps stand-alone scheduler
    /// use working.
    #[must_use]
    pub fn pu_num(&self, worker: usize) -> PuId {
        if self.is_initialized() {
            return self.state.lock().affinity.get_pu_num(worker);
        }

        worker as PuId
    }

    /// The affinity mask of worker `worker`; one-hot on the worker's own index before
    /// initialization.
    #[must_use]
    pub fn pu_mask(&self, worker: usize) -> PuMask {
        if self.is_initialized() {
            return self.state.lock().affinity.get_pu_mask(worker);
        }

        PuMask::one_hot(self.hardware_concurrency, worker as PuId)
    }

    /// The set of PUs the process occupies; one-hot on `pu` before initialization.
    #[must_use]
    pub fn used_pus_mask(&self, pu: PuId) -> PuMask {
        if self.is_initialized() {
            return self.state.lock().affinity.get_used_pus_mask(pu);
        }

        PuMask::one_hot(self.hardware_concurrency, pu)
    }

    /// How many logical workers are placed on `pu`.
    #[must_use]
    pub fn thread_occupancy(&self, pu: PuId) -> usize {
        self.state.lock().affinity.get_thread_occupancy(pu)
    }

    /// The first core of the machine this process is meant to occupy.
    #[must_use]
    pub fn first_used_core(&self) -> usize {
        self.state.lock().first_used_core
    }

    /// Records the first core of the machine this process is meant to occupy.
    pub fn set_first_used_core(&self, first_used_core: usize) {
        self.state.lock().first_used_core = first_used_core;
    }

    /// A human-readable dump of every pool and its PU assignment.
    #[must_use]
    pub fn format_pools(&self) -> String {
        Self::format_pools_locked(&self.state.lock())
    }

    fn format_pools_locked(state: &PartitionerState) -> String {
        use std::fmt::Write;

        let mut out = format!(
            "the resource partitioner owns {} pool(s):\n",
            state.pools.len()
        );

        for pool in &state.pools {
            let _ = write!(out, "{pool}");
        }

        out
    }

    fn pool_index_by_name(state: &PartitionerState, pool_name: &str) -> Result<usize> {
        if pool_name == DEFAULT_POOL_NAME {
            return Ok(0);
        }

        state
            .pools
            .iter()
            .position(|pool| pool.name == pool_name)
            .ok_or_else(|| Error::BadParameter {
                operation: "Partitioner::pool_index",
                problem: format!(
                    "the resource partitioner does not own a thread pool named '{pool_name}'"
                ),
            })
    }

    fn pool_by_name<'a>(state: &'a PartitionerState, pool_name: &str) -> Result<&'a PoolData> {
        let index = Self::pool_index_by_name(state, pool_name)?;
        Ok(&state.pools[index])
    }

    fn pool_by_name_mut<'a>(
        state: &'a mut PartitionerState,
        pool_name: &str,
    ) -> Result<&'a mut PoolData> {
        let index = Self::pool_index_by_name(state, pool_name)?;
        Ok(&mut state.pools[index])
    }

    fn pool_at<'a>(state: &'a PartitionerState, pool_index: usize) -> Result<&'a PoolData> {
        state
            .pools
            .get(pool_index)
            .ok_or_else(|| Error::BadParameter {
                operation: "Partitioner::pool_at",
                problem: format!(
                    "pool index {pool_index} too large: the resource partitioner owns only {} \
                     thread pools",
                    state.pools.len()
                ),
            })
    }
}

impl Drop for Partitioner {
    fn drop(&mut self) {
        INSTANCE_COUNT.fetch_sub(1, Ordering::SeqCst);
        pool_data::reset_num_threads_overall();
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::MapConfig;
    use crate::fake::TopologyBuilder;
    use crate::testing::process_state_guard;

    fn topology(pus: usize) -> TopologyFacade {
        TopologyFacade::from_fake(
            TopologyBuilder::uniform(nz!(1), pus.try_into().unwrap(), nz!(1)).build(),
        )
    }

    fn config(os_threads: usize) -> MapConfig {
        MapConfig::new().with("hpx.os_threads", os_threads.to_string())
    }

    #[test]
    fn second_instance_is_rejected_while_first_lives() {
        let _guard = process_state_guard();

        let first = Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();
        let second = Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4));

        assert!(matches!(second, Err(Error::InvalidStatus { .. })));

        drop(first);

        // Dropping the survivor frees the instance slot again.
        let third = Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4));
        assert!(third.is_ok());
    }

    #[test]
    fn failed_construction_frees_the_instance_slot() {
        let _guard = process_state_guard();

        // Missing os_threads entry fails construction.
        let failed =
            Partitioner::new(PartitionerMode::DEFAULT, &MapConfig::new(), topology(4));
        assert!(failed.is_err());

        let retry = Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4));
        assert!(retry.is_ok());
    }

    #[test]
    fn mirror_reflects_exposed_pus_only() {
        let _guard = process_state_guard();

        // Two of four PUs are exposed by a two-thread budget.
        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(2), topology(4)).unwrap();

        let domains = partitioner.numa_domains();
        let pu_ids: Vec<PuId> = domains
            .iter()
            .flat_map(|domain| domain.cores())
            .flat_map(Core::pus)
            .map(Pu::id)
            .collect();

        assert_eq!(pu_ids, vec![0, 1]);
    }

    #[test]
    fn mirror_walks_sockets_when_numa_nodes_are_absent() {
        let _guard = process_state_guard();

        let fake = TopologyBuilder::uniform(nz!(2), nz!(2), nz!(1))
            .report_zero_numa_nodes()
            .build();
        let partitioner = Partitioner::new(
            PartitionerMode::DEFAULT,
            &config(4),
            TopologyFacade::from_fake(fake),
        )
        .unwrap();

        assert_eq!(partitioner.numa_domains().len(), 2);
    }

    #[test]
    fn duplicate_pool_name_is_rejected() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        partitioner
            .create_thread_pool("io", SchedulingPolicy::Local, None, None)
            .unwrap();
        let error = partitioner
            .create_thread_pool("io", SchedulingPolicy::Local, None, None)
            .unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn empty_pool_name_is_rejected() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        let error = partitioner
            .create_thread_pool("", SchedulingPolicy::Local, None, None)
            .unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn redeclaring_default_replaces_index_zero() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        partitioner
            .create_thread_pool("default", SchedulingPolicy::Static, None, None)
            .unwrap();

        assert_eq!(partitioner.num_pools(), 1);
        assert_eq!(
            partitioner.which_scheduler("default").unwrap(),
            SchedulingPolicy::Static
        );
    }

    #[test]
    fn add_resource_to_unknown_pool_is_rejected() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();
        let domains = partitioner.numa_domains();

        let error = partitioner
            .add_resource(&domains[0].cores()[0].pus()[0], "nope", true, 1)
            .unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn non_exclusive_binding_requires_dynamic_pools() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();
        let domains = partitioner.numa_domains();

        let error = partitioner
            .add_resource(&domains[0].cores()[0].pus()[0], "default", false, 1)
            .unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn occupancy_budget_is_enforced() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(2), topology(2)).unwrap();
        let domains = partitioner.numa_domains();
        let pu = &domains[0].cores()[0].pus()[0];

        partitioner.add_resource(pu, "default", true, 1).unwrap();
        let error = partitioner.add_resource(pu, "default", true, 1).unwrap_err();

        assert!(matches!(error, Error::Runtime { .. }));
    }

    #[test]
    fn os_thread_budget_is_enforced() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(1), topology(1)).unwrap();
        let domains = partitioner.numa_domains();

        // Two workers on one budgeted OS thread.
        let error = partitioner
            .add_resource(&domains[0].cores()[0].pus()[0], "default", true, 2)
            .unwrap_err();

        assert!(matches!(error, Error::Runtime { .. }));
    }

    #[test]
    fn oversubscription_lifts_both_budgets() {
        let _guard = process_state_guard();

        let partitioner = Partitioner::new(
            PartitionerMode::ALLOW_OVERSUBSCRIPTION,
            &config(2),
            topology(2),
        )
        .unwrap();
        let domains = partitioner.numa_domains();
        let pu = &domains[0].cores()[0].pus()[0];

        partitioner.add_resource(pu, "default", true, 2).unwrap();
        partitioner.add_resource(pu, "default", true, 2).unwrap();

        partitioner.configure_pools().unwrap();

        // 4 workers on PU 0 plus the filled-in PU 1.
        assert_eq!(partitioner.num_threads(), 5);
    }

    #[test]
    fn which_scheduler_rejects_unspecified() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        let error = partitioner.which_scheduler("default").unwrap_err();

        assert!(matches!(error, Error::BadParameter { .. }));
    }

    #[test]
    fn default_scheduler_mode_comes_from_configuration() {
        let _guard = process_state_guard();

        let config = config(4).with("hpx.default_scheduler_mode", "1");
        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config, topology(4)).unwrap();

        assert_eq!(
            partitioner.scheduler_mode(0).unwrap(),
            SchedulerMode::DO_BACKGROUND_WORK
        );
    }

    #[test]
    fn unknown_scheduler_string_fails_configuration() {
        let _guard = process_state_guard();

        let config = config(4).with("hpx.scheduler", "banana");
        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config, topology(4)).unwrap();

        let error = partitioner.configure_pools().unwrap_err();

        assert!(matches!(error, Error::CommandLine { .. }));
    }

    #[test]
    fn empty_user_pool_fails_configuration() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();
        partitioner
            .create_thread_pool("starved", SchedulingPolicy::Local, None, None)
            .unwrap();

        let error = partitioner.configure_pools().unwrap_err();

        assert!(matches!(error, Error::Runtime { .. }));
    }

    #[test]
    fn default_pool_without_threads_fails_configuration() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(2), topology(2)).unwrap();
        partitioner
            .create_thread_pool("io", SchedulingPolicy::Local, None, None)
            .unwrap();

        // Every exposed PU goes to "io"; nothing is left for the default pool.
        let domains = partitioner.numa_domains();
        partitioner
            .add_resource_domain(&domains[0], "io", true)
            .unwrap();

        let error = partitioner.configure_pools().unwrap_err();

        assert!(matches!(error, Error::InvalidStatus { .. }));
    }

    #[test]
    fn queries_answer_identity_before_initialization() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        assert!(!partitioner.is_initialized());
        assert_eq!(partitioner.pu_num(2), 2);
        assert!(partitioner.pu_mask(2).is_set(2));
        assert_eq!(partitioner.pu_mask(2).count(), 1);
        assert!(partitioner.used_pus_mask(3).is_set(3));
    }

    #[test]
    fn first_used_core_round_trips() {
        let _guard = process_state_guard();

        let config = config(4).with("hpx.first_used_core", "2");
        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config, topology(4)).unwrap();

        assert_eq!(partitioner.first_used_core(), 2);

        partitioner.set_first_used_core(0);
        assert_eq!(partitioner.first_used_core(), 0);
    }

    #[test]
    fn pool_creator_is_returned_for_user_defined_pools() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();

        partitioner
            .create_thread_pool_with_factory(
                "custom",
                std::sync::Arc::new(|index| Box::new(index) as Box<dyn std::any::Any + Send>),
                None,
            )
            .unwrap();

        assert!(partitioner.pool_creator(1).unwrap().is_some());
        assert!(partitioner.pool_creator(0).unwrap().is_none());
        assert!(matches!(
            partitioner.pool_creator(7),
            Err(Error::BadParameter { .. })
        ));
        assert_eq!(
            partitioner.which_scheduler("custom").unwrap(),
            SchedulingPolicy::UserDefined
        );
    }

    #[test]
    fn format_pools_dumps_every_pool() {
        let _guard = process_state_guard();

        let partitioner =
            Partitioner::new(PartitionerMode::DEFAULT, &config(4), topology(4)).unwrap();
        partitioner
            .create_thread_pool("io", SchedulingPolicy::Local, None, None)
            .unwrap();

        let dump = partitioner.format_pools();

        assert!(dump.contains("2 pool(s)"));
        assert!(dump.contains("[pool \"default\"]"));
        assert!(dump.contains("[pool \"io\"]"));
    }
}
