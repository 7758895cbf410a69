//! Layering of the call graph into ordered parallel groups.
//!
//! Kahn-style waves: each iteration collects every not-yet-scheduled call
//! whose dependencies are all scheduled. A cycle leaves no call ready; the
//! scheduler then force-schedules one arbitrary call into its own
//! singleton group with a warning. Readiness is evaluated against the
//! scheduled set, so the forced call immediately unblocks its dependents
//! and every iteration makes progress — the loop terminates on any input.

use tracing::warn;

use super::builder::{CallGraph, CallIndex};

/// Ordered groups of call indices. Every call in group k depends only on
/// calls in groups 0..k-1, and every call appears exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub groups: Vec<Vec<CallIndex>>,
}

impl ExecutionPlan {
    pub fn call_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Compute the execution plan for a built call graph.
pub fn plan(graph: &CallGraph) -> ExecutionPlan {
    let n = graph.len();
    let mut scheduled = vec![false; n];
    let mut scheduled_count = 0;
    let mut groups: Vec<Vec<CallIndex>> = Vec::new();

    while scheduled_count < n {
        let ready: Vec<CallIndex> = (0..n)
            .filter(|&i| {
                !scheduled[i] && graph.dependencies(i).iter().all(|&dep| scheduled[dep])
            })
            .collect();

        if ready.is_empty() {
            // Dependency cycle: force one arbitrary unscheduled call into
            // its own group to break the deadlock.
            let Some(forced) = (0..n).find(|&i| !scheduled[i]) else {
                break;
            };
            warn!(target: "crucible::dag", call_id = %graph.call(forced).id,
                tool = %graph.call(forced).name,
                "dependency cycle in tool batch, force-scheduling call");
            scheduled[forced] = true;
            scheduled_count += 1;
            groups.push(vec![forced]);
            continue;
        }

        for &i in &ready {
            scheduled[i] = true;
        }
        scheduled_count += ready.len();
        groups.push(ready);
    }

    ExecutionPlan { groups }
}
