use std::collections::BTreeSet;

use protocol::{DuplicateNode, RecoverPlan, RecoverSource, Seq};

/// What one reachable replica holds of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSeqs {
    pub node: DuplicateNode,
    /// path of the file on this replica
    pub path: String,
    pub seqs: Vec<Seq>,
}

/// Plans how to bring every replica up to the union of what all replicas
/// hold. Returns, per lagging replica (by index), the seqs it should end up
/// with and the peers to pull from, best source first.
pub fn plan_recovery(replicas: &[ReplicaSeqs]) -> Vec<(usize, RecoverPlan)> {
    let held: Vec<BTreeSet<Seq>> = replicas
        .iter()
        .map(|r| r.seqs.iter().copied().collect())
        .collect();
    let union: BTreeSet<Seq> = held.iter().flatten().copied().collect();

    let mut plans = Vec::new();
    for (lagging, have) in held.iter().enumerate() {
        let missing: BTreeSet<Seq> = union.difference(have).copied().collect();
        if missing.is_empty() {
            continue;
        }

        let mut sources: Vec<(usize, &ReplicaSeqs)> = replicas
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != lagging)
            .map(|(i, replica)| (held[i].intersection(&missing).count(), replica))
            .filter(|(useful, _)| *useful > 0)
            .collect();
        // stable, ties keep replica order
        sources.sort_by(|a, b| b.0.cmp(&a.0));

        let plan = RecoverPlan {
            seqs: union.iter().copied().collect(),
            sources: sources
                .into_iter()
                .map(|(_, replica)| RecoverSource {
                    node: replica.node.clone(),
                    path: replica.path.clone(),
                })
                .collect(),
        };
        plans.push((lagging, plan));
    }
    plans
}
