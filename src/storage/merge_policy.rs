use std::ops::Range;
use serde::{Deserialize, Serialize};

/// What a merge policy sees of one sealed partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStat {
    pub doc_count: u64,
}

/// Policy for deciding which sealed partitions to merge.
///
/// A selection is always a contiguous run of at least two partitions, so the
/// merged id range stays disjoint from and ordered with its neighbours.
pub trait MergePolicy: Send + Sync {
    fn select(&self, parts: &[PartitionStat]) -> Option<Range<usize>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicyKind {
    #[default]
    Floor,
    Tiered,
}

impl MergePolicyKind {
    pub fn build(self, min_doc_count: u64, max_doc_count: u64) -> Box<dyn MergePolicy> {
        match self {
            MergePolicyKind::Floor => Box::new(FloorMergePolicy {
                min_doc_count,
                max_doc_count,
            }),
            MergePolicyKind::Tiered => Box::new(TieredMergePolicy {
                min_doc_count,
                max_doc_count,
            }),
        }
    }
}

/// Merges partitions that already reached the size floor: the first run of two or
/// more partitions of at least `min_doc_count` docs, grown while the combined size
/// stays within `max_doc_count`.
pub struct FloorMergePolicy {
    pub min_doc_count: u64,
    pub max_doc_count: u64,
}

impl MergePolicy for FloorMergePolicy {
    fn select(&self, parts: &[PartitionStat]) -> Option<Range<usize>> {
        first_run(parts, |p| p.doc_count >= self.min_doc_count, self.max_doc_count, true)
    }

    fn name(&self) -> &str {
        "floor"
    }
}

/// Folds small partitions together: the first run of two or more partitions below
/// `min_doc_count` whose combined size stays under `max_doc_count`.
pub struct TieredMergePolicy {
    pub min_doc_count: u64,
    pub max_doc_count: u64,
}

impl MergePolicy for TieredMergePolicy {
    fn select(&self, parts: &[PartitionStat]) -> Option<Range<usize>> {
        first_run(parts, |p| p.doc_count < self.min_doc_count, self.max_doc_count, false)
    }

    fn name(&self) -> &str {
        "tiered"
    }
}

fn first_run(
    parts: &[PartitionStat],
    eligible: impl Fn(&PartitionStat) -> bool,
    max_total: u64,
    inclusive: bool,
) -> Option<Range<usize>> {
    let fits = |total: u64| if inclusive { total <= max_total } else { total < max_total };

    let mut start = 0;
    while start < parts.len() {
        if !eligible(&parts[start]) {
            start += 1;
            continue;
        }
        let mut end = start + 1;
        let mut total = parts[start].doc_count;
        while end < parts.len() && eligible(&parts[end]) && fits(total + parts[end].doc_count) {
            total += parts[end].doc_count;
            end += 1;
        }
        if end - start >= 2 {
            return Some(start..end);
        }
        start += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(counts: &[u64]) -> Vec<PartitionStat> {
        counts.iter().map(|&doc_count| PartitionStat { doc_count }).collect()
    }

    #[test]
    fn floor_policy_picks_first_full_run() {
        let policy = FloorMergePolicy {
            min_doc_count: 3,
            max_doc_count: 100,
        };
        assert_eq!(policy.select(&stats(&[3, 3])), Some(0..2));
        assert_eq!(policy.select(&stats(&[1, 3, 4, 2, 5])), Some(1..3));
        assert_eq!(policy.select(&stats(&[3, 1, 3])), None);
        assert_eq!(policy.select(&stats(&[3])), None);
    }

    #[test]
    fn floor_policy_respects_max() {
        let policy = FloorMergePolicy {
            min_doc_count: 10,
            max_doc_count: 25,
        };
        assert_eq!(policy.select(&stats(&[10, 10, 10])), Some(0..2));
        assert_eq!(policy.select(&stats(&[20, 10, 10])), Some(1..3));
    }

    #[test]
    fn tiered_policy_folds_small_partitions() {
        let policy = TieredMergePolicy {
            min_doc_count: 100,
            max_doc_count: 150,
        };
        assert_eq!(policy.select(&stats(&[500, 40, 50, 60, 500])), Some(1..3));
        assert_eq!(policy.select(&stats(&[40, 500, 50])), None);
    }

    #[test]
    fn policy_kind_parses_lowercase() {
        let kind: MergePolicyKind = serde_json::from_str("\"tiered\"").unwrap();
        assert_eq!(kind.build(1, 2).name(), "tiered");
    }
}
