/// Identifies a specific processing unit (PU).
///
/// A PU is the smallest schedulable hardware unit - a hardware thread, in SMT terms.
/// IDs are global across the machine and lie in `0..hardware_concurrency`.
pub type PuId = u32;

/// Identifies a NUMA domain.
///
/// Domains are indexed in topology order, starting from zero.
pub type NumaNodeId = u32;
