//! Scheduling policies and scheduler-mode flags attached to thread pools.
//!
//! The partitioner never instantiates a scheduler; it only records which policy each pool is
//! to be driven by and hands that choice back to the runtime layer.

use std::ops::BitOr;

use derive_more::Display;

use crate::{Error, Result};

/// The algorithm a pool's scheduler uses to select work.
///
/// [`Unspecified`][Self::Unspecified] is a placeholder that the configuration driver replaces
/// with the process-wide default before the runtime instantiates any pool.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SchedulingPolicy {
    /// No policy has been chosen yet; resolved to the configured default during
    /// pool configuration.
    #[display("unspecified")]
    Unspecified,

    /// The pool is driven by a scheduler built through a user-supplied factory.
    #[display("user-defined")]
    UserDefined,

    /// Work-stealing scheduler with one queue per worker.
    #[display("local")]
    Local,

    /// Work-stealing scheduler with per-worker FIFO queues and a high-priority lane.
    #[display("local-priority-fifo")]
    LocalPriorityFifo,

    /// Work-stealing scheduler with per-worker LIFO queues and a high-priority lane.
    #[display("local-priority-lifo")]
    LocalPriorityLifo,

    /// Work-requesting scheduler with FIFO queues.
    #[display("local-workrequesting-fifo")]
    LocalWorkrequestingFifo,

    /// Work-requesting scheduler with LIFO queues.
    #[display("local-workrequesting-lifo")]
    LocalWorkrequestingLifo,

    /// Work-requesting scheduler with message-passing queues.
    #[display("local-workrequesting-mc")]
    LocalWorkrequestingMc,

    /// Static scheduler without work stealing.
    #[display("static")]
    Static,

    /// Static scheduler with a high-priority lane, without work stealing.
    #[display("static-priority")]
    StaticPriority,

    /// ABP deque-based scheduler with FIFO ordering and a high-priority lane.
    #[display("abp-priority-fifo")]
    AbpPriorityFifo,

    /// ABP deque-based scheduler with LIFO ordering and a high-priority lane.
    #[display("abp-priority-lifo")]
    AbpPriorityLifo,

    /// Scheduler sharing priority queues across all workers.
    #[display("shared-priority")]
    SharedPriority,
}

/// Known policy names in resolution scan order.
///
/// The order is observable: a user string is accepted as soon as it is a prefix of an entry, so
/// "local" resolves to `Local` while "local-p" falls through to `LocalPriorityFifo`. Do not
/// reorder.
const POLICY_NAMES: &[(&str, SchedulingPolicy)] = &[
    ("local", SchedulingPolicy::Local),
    ("local-priority-fifo", SchedulingPolicy::LocalPriorityFifo),
    ("local-priority-lifo", SchedulingPolicy::LocalPriorityLifo),
    (
        "local-workrequesting-fifo",
        SchedulingPolicy::LocalWorkrequestingFifo,
    ),
    (
        "local-workrequesting-lifo",
        SchedulingPolicy::LocalWorkrequestingLifo,
    ),
    (
        "local-workrequesting-mc",
        SchedulingPolicy::LocalWorkrequestingMc,
    ),
    ("static", SchedulingPolicy::Static),
    ("static-priority", SchedulingPolicy::StaticPriority),
    ("abp-priority-fifo", SchedulingPolicy::AbpPriorityFifo),
    ("abp-priority-lifo", SchedulingPolicy::AbpPriorityLifo),
    ("shared-priority", SchedulingPolicy::SharedPriority),
];

/// Resolves a user-supplied scheduler string to a policy by prefix match.
pub(crate) fn resolve_policy(name: &str) -> Result<SchedulingPolicy> {
    POLICY_NAMES
        .iter()
        .find(|(known, _)| known.starts_with(name))
        .map(|(_, policy)| *policy)
        .ok_or_else(|| Error::CommandLine {
            problem: format!("'{name}' does not match any known scheduling policy"),
        })
}

/// Behavior flags applied to a pool's scheduler.
///
/// Pools inherit the process default unless a mode is set explicitly at pool creation.
/// Combine flags with `|`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedulerMode(u32);

impl SchedulerMode {
    /// No flags set.
    pub const NOTHING_SPECIAL: Self = Self(0);

    /// The scheduler performs background work between tasks.
    pub const DO_BACKGROUND_WORK: Self = Self(0x001);

    /// Worker threads run at reduced OS priority.
    pub const REDUCE_THREAD_PRIORITY: Self = Self(0x002);

    /// Workers linger briefly before exiting when idle.
    pub const DELAY_EXIT: Self = Self(0x004);

    /// Workers spin longer before sleeping.
    pub const FAST_IDLE_MODE: Self = Self(0x008);

    /// The pool may grow and shrink its worker set while running.
    pub const ENABLE_ELASTICITY: Self = Self(0x010);

    /// Workers steal work from each other.
    pub const ENABLE_STEALING: Self = Self(0x020);

    /// Workers steal across NUMA domain boundaries.
    pub const ENABLE_STEALING_NUMA: Self = Self(0x040);

    /// New work is distributed round-robin over the pool's workers.
    pub const ASSIGN_WORK_ROUND_ROBIN: Self = Self(0x080);

    /// New work is placed on the worker that spawned it.
    pub const ASSIGN_WORK_THREAD_PARENT: Self = Self(0x100);

    /// Stealing prefers high-priority work.
    pub const STEAL_HIGH_PRIORITY_FIRST: Self = Self(0x200);

    /// Workers exhaust their own queues before stealing.
    pub const STEAL_AFTER_LOCAL: Self = Self(0x400);

    /// Idle workers back off exponentially.
    pub const ENABLE_IDLE_BACKOFF: Self = Self(0x800);

    /// Every flag the runtime understands.
    pub const ALL_FLAGS: Self = Self(0xfff);

    /// The process-wide default mode inherited by pools that do not set one.
    pub const DEFAULT_MODE: Self = Self(Self::DO_BACKGROUND_WORK.0
        | Self::REDUCE_THREAD_PRIORITY.0
        | Self::DELAY_EXIT.0
        | Self::ENABLE_STEALING.0
        | Self::ENABLE_STEALING_NUMA.0
        | Self::ASSIGN_WORK_ROUND_ROBIN.0
        | Self::STEAL_AFTER_LOCAL.0
        | Self::ENABLE_IDLE_BACKOFF.0);

    /// Interprets `bits` as a mode, rejecting bits outside [`ALL_FLAGS`][Self::ALL_FLAGS].
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL_FLAGS.0 != 0 {
            return None;
        }
        Some(Self(bits))
    }

    /// Interprets `bits` as a mode, dropping bits outside [`ALL_FLAGS`][Self::ALL_FLAGS].
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL_FLAGS.0)
    }

    /// The raw flag bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag of `other` is set in this mode.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SchedulerMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for SchedulerMode {
    fn default() -> Self {
        Self::DEFAULT_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_resolve() {
        assert_eq!(resolve_policy("local").unwrap(), SchedulingPolicy::Local);
        assert_eq!(resolve_policy("static").unwrap(), SchedulingPolicy::Static);
        assert_eq!(
            resolve_policy("shared-priority").unwrap(),
            SchedulingPolicy::SharedPriority
        );
    }

    #[test]
    fn prefix_resolution_is_scan_order_sensitive() {
        // "local" is tried first, so the bare prefix stops there.
        assert_eq!(resolve_policy("loc").unwrap(), SchedulingPolicy::Local);

        // "local-p" is not a prefix of "local" and falls through to the fifo variant.
        assert_eq!(
            resolve_policy("local-p").unwrap(),
            SchedulingPolicy::LocalPriorityFifo
        );

        assert_eq!(
            resolve_policy("local-priority-lifo").unwrap(),
            SchedulingPolicy::LocalPriorityLifo
        );

        // "static-p" skips past "static" the same way.
        assert_eq!(
            resolve_policy("static-p").unwrap(),
            SchedulingPolicy::StaticPriority
        );
    }

    #[test]
    fn unknown_name_is_rejected() {
        let error = resolve_policy("banana").unwrap_err();

        assert!(matches!(error, Error::CommandLine { .. }));
    }

    #[test]
    fn empty_string_matches_first_entry() {
        // An empty string is a prefix of everything; the scan order makes "local" win.
        assert_eq!(resolve_policy("").unwrap(), SchedulingPolicy::Local);
    }

    #[test]
    fn policy_names_render_with_dashes() {
        assert_eq!(
            SchedulingPolicy::LocalPriorityFifo.to_string(),
            "local-priority-fifo"
        );
        assert_eq!(SchedulingPolicy::Static.to_string(), "static");
    }

    #[test]
    fn default_mode_is_within_all_flags() {
        assert!(SchedulerMode::ALL_FLAGS.contains(SchedulerMode::DEFAULT_MODE));
    }

    #[test]
    fn default_mode_enables_stealing_but_not_elasticity() {
        let mode = SchedulerMode::default();

        assert!(mode.contains(SchedulerMode::ENABLE_STEALING));
        assert!(!mode.contains(SchedulerMode::ENABLE_ELASTICITY));
    }

    #[test]
    fn mode_bits_round_trip() {
        let mode = SchedulerMode::DELAY_EXIT | SchedulerMode::FAST_IDLE_MODE;

        assert_eq!(SchedulerMode::from_bits(mode.bits()), Some(mode));
        assert_eq!(SchedulerMode::from_bits(0x1000), None);
        assert_eq!(
            SchedulerMode::from_bits_truncate(0x1004),
            SchedulerMode::DELAY_EXIT
        );
        assert!(!SchedulerMode::NOTHING_SPECIAL.contains(SchedulerMode::DELAY_EXIT));
    }
}
