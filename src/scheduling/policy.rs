use serde::{Deserialize, Serialize};

use crate::queue::QueueItemType;

/// How a network's configured types are grouped into rotation rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    /// One round holding every type.
    FlatFifo,
    /// Like `FlatFifo`, but the latest-reward-snapshot type only appears in
    /// its own round.
    LatestExcluded,
    /// One type per round.
    #[default]
    RoundRobin,
    /// Each type's round also carries the types it depends on.
    DependencyOrdered,
}

impl SchedulingPolicy {
    /// Builds the rounds for `types`, keeping their configured order.
    pub fn rounds(&self, types: &[QueueItemType]) -> Vec<Vec<QueueItemType>> {
        let types = dedup(types);
        if types.is_empty() {
            return Vec::new();
        }

        match self {
            SchedulingPolicy::FlatFifo => vec![types],
            SchedulingPolicy::LatestExcluded => {
                let latest = QueueItemType::LatestRewardSnapshot;
                let others: Vec<QueueItemType> =
                    types.iter().copied().filter(|t| *t != latest).collect();
                types
                    .iter()
                    .map(|t| if *t == latest { vec![latest] } else { others.clone() })
                    .collect()
            }
            SchedulingPolicy::RoundRobin => types.iter().map(|t| vec![*t]).collect(),
            SchedulingPolicy::DependencyOrdered => types
                .iter()
                .map(|t| {
                    let mut round: Vec<QueueItemType> = dependencies(*t)
                        .iter()
                        .copied()
                        .filter(|dep| types.contains(dep))
                        .collect();
                    round.push(*t);
                    round
                })
                .collect(),
        }
    }
}

/// Types whose work should be drained alongside `item_type`.
pub fn dependencies(item_type: QueueItemType) -> &'static [QueueItemType] {
    use QueueItemType::*;
    match item_type {
        Block | HypervisorStatic | RewardStatic => &[],
        Price => &[Block],
        Operation => &[HypervisorStatic, Block],
        HypervisorStatus => &[Block],
        RewardStatus => &[Block, Price, HypervisorStatus, RewardStatic],
        RevenueOperation => &[Block, Price],
        UserOperation => &[Operation, HypervisorStatus],
        LatestRewardSnapshot => &[Block, RewardStatic],
    }
}

fn dedup(types: &[QueueItemType]) -> Vec<QueueItemType> {
    let mut out = Vec::with_capacity(types.len());
    for t in types {
        if !out.contains(t) {
            out.push(*t);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use QueueItemType::*;

    #[test]
    fn test_flat_fifo_single_round() {
        let rounds = SchedulingPolicy::FlatFifo.rounds(&[Block, Price, Block]);
        assert_eq!(rounds, vec![vec![Block, Price]]);
    }

    #[test]
    fn test_latest_excluded_isolates_latest_snapshot() {
        let rounds =
            SchedulingPolicy::LatestExcluded.rounds(&[Block, LatestRewardSnapshot, Price]);
        assert_eq!(
            rounds,
            vec![vec![Block, Price], vec![LatestRewardSnapshot], vec![Block, Price]]
        );
    }

    #[test]
    fn test_round_robin_one_type_per_round() {
        let rounds = SchedulingPolicy::RoundRobin.rounds(&[Block, Price, Operation]);
        assert_eq!(rounds, vec![vec![Block], vec![Price], vec![Operation]]);
    }

    #[test]
    fn test_dependency_ordered_only_includes_configured_dependencies() {
        let rounds =
            SchedulingPolicy::DependencyOrdered.rounds(&[Block, Price, HypervisorStatus, RewardStatus]);
        assert_eq!(rounds[0], vec![Block]);
        assert_eq!(rounds[1], vec![Block, Price]);
        assert_eq!(rounds[3], vec![Block, Price, HypervisorStatus, RewardStatus]);
    }

    #[test]
    fn test_empty_types_yield_no_rounds() {
        assert!(SchedulingPolicy::FlatFifo.rounds(&[]).is_empty());
    }

    #[test]
    fn test_policy_names() {
        let policy: SchedulingPolicy = serde_json::from_str("\"dependency-ordered\"").unwrap();
        assert_eq!(policy, SchedulingPolicy::DependencyOrdered);
        let policy: SchedulingPolicy = serde_json::from_str("\"latest-excluded\"").unwrap();
        assert_eq!(policy, SchedulingPolicy::LatestExcluded);
    }
}
