//! Merge engine
//!
//! Layered bottom-up:
//! 1. `pipeline` - CI status of a branch head
//! 2. `gate` - merge policy for one request
//! 3. `fuse` - rebase/merge and commit trailers in the working copy
//! 4. `job` - one request end to end, with retries
//! 5. `batch` - several requests tested by one pipeline
//! 6. `plan` / `execute` - pick a group (pure) and run a cycle (effectful)

mod batch;
mod execute;
mod fuse;
mod gate;
mod job;
mod pipeline;
mod plan;

pub use batch::{BatchContext, BatchEntry, BatchMergeJob, BatchReport};
pub use execute::{CycleReport, RequestOutcome, merge_solo, run_cycle};
pub use fuse::Fuser;
pub use gate::{GateMode, MergeRequestGate, Readiness};
pub use job::{Fused, JobState, MergeJob, RequestOrchestrator, SingleRequestOrchestrator};
pub use pipeline::PipelineTracker;
pub use plan::{
    TargetGroup, group_by_target_branch, requests_with_common_target_branch, select_group,
};
