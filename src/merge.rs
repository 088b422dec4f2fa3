//! Segment merging: what to merge, and on which thread.
//!
//! A [`MergePolicy`] looks at the catalog and proposes [`OneMerge`]s; the
//! writer registers them, reserving their source segments; a
//! [`MergeScheduler`] decides when and where the registered merges run.

pub mod one_merge;
pub mod policy;
pub mod scheduler;
pub mod tiered;

pub use one_merge::OneMerge;
pub use policy::{MergeContext, MergePolicy, MergeSpecification, MergeTrigger, NoMergePolicy};
pub use scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeProvider, MergeScheduler,
    MergeSchedulerStats, SerialMergeScheduler,
};
pub use tiered::{TieredMergePolicy, TieredMergePolicyConfig};
