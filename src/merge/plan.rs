//! Candidate grouping - pure functions
//!
//! No I/O happens here: the driver fetches candidates, these functions decide
//! which of them run together.

use crate::types::MergeRequest;

/// Requests targeting `target_branch`, in input order
pub fn requests_with_common_target_branch<'r>(
    requests: &'r [MergeRequest],
    target_branch: &str,
) -> Vec<&'r MergeRequest> {
    requests
        .iter()
        .filter(|mr| mr.target_branch == target_branch)
        .collect()
}

/// Requests that share a target branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    /// Common target branch
    pub target_branch: String,
    /// Members in input order
    pub requests: Vec<MergeRequest>,
}

/// Group requests by target branch
///
/// Groups appear in the order their first member appears in the input, and
/// members keep their relative order, so the same candidate list always
/// yields the same batches.
pub fn group_by_target_branch(requests: &[MergeRequest]) -> Vec<TargetGroup> {
    let mut groups: Vec<TargetGroup> = Vec::new();
    for request in requests {
        if groups
            .iter()
            .any(|g| g.target_branch == request.target_branch)
        {
            continue;
        }
        groups.push(TargetGroup {
            target_branch: request.target_branch.clone(),
            requests: requests_with_common_target_branch(requests, &request.target_branch)
                .into_iter()
                .cloned()
                .collect(),
        });
    }
    groups
}

/// The group the next cycle works on: the one holding the oldest candidate
pub fn select_group(requests: &[MergeRequest]) -> Option<TargetGroup> {
    group_by_target_branch(requests).into_iter().next()
}
