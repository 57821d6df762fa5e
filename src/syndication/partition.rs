//! ID-space partitioning of the shared target database.
//!
//! Every source environment owns one contiguous id range. Environment `i`
//! (in processing order) starts at `base_offset + i * increment`; since only
//! rows below the local threshold are exported, its shifted ids stay below
//! the start of environment `i + 1`.

use crate::config::IdSpaceConfig;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpacePartition {
    pub base_offset: i64,
    pub increment: i64,
}

impl Default for IdSpacePartition {
    fn default() -> Self {
        Self::from(&IdSpaceConfig::default())
    }
}

impl From<&IdSpaceConfig> for IdSpacePartition {
    fn from(config: &IdSpaceConfig) -> Self {
        Self {
            base_offset: config.base_offset,
            increment: config.increment,
        }
    }
}

impl IdSpacePartition {
    pub fn new(base_offset: i64, increment: i64) -> Self {
        Self {
            base_offset,
            increment,
        }
    }

    /// Offset added to every key of the environment at `index`
    pub fn offset(&self, index: usize) -> i64 {
        self.base_offset + (index as i64) * self.increment
    }

    /// Offset relative to the base; `{0, I, 2I, ...}` in processing order
    pub fn relative_offset(&self, index: usize) -> i64 {
        self.offset(index) - self.base_offset
    }

    /// Ids the environment at `index` may occupy
    pub fn range(&self, index: usize) -> Range<i64> {
        let start = self.offset(index);
        start..start + self.increment
    }

    /// Offsets for `environments`, paired with their names
    pub fn assign<'a, S: AsRef<str>>(&self, environments: &'a [S]) -> Vec<(&'a str, i64)> {
        environments
            .iter()
            .enumerate()
            .map(|(index, env)| (env.as_ref(), self.offset(index)))
            .collect()
    }

    /// True for ids that arrived through syndication
    pub fn is_syndicated(&self, id: i64) -> bool {
        id >= self.base_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const I: i64 = 1_000_000_000;

    #[test]
    fn test_second_environment_range() {
        let partition = IdSpacePartition::new(0, I);
        let assigned = partition.assign(&["x", "y"]);
        assert_eq!(assigned, vec![("x", 0), ("y", I)]);

        for local_id in [1_i64, 42, I - 1] {
            let shifted = local_id + partition.offset(1);
            assert!(partition.range(1).contains(&shifted));
            assert!(shifted >= I && shifted < 2 * I);
        }
    }

    #[test]
    fn test_deployment_layout_keeps_local_rows_clear() {
        let partition = IdSpacePartition::default();
        let assigned = partition.assign(&["x", "y"]);
        assert_eq!(assigned, vec![("x", I), ("y", 2 * I)]);
        assert_eq!(partition.relative_offset(1), I);
        assert_eq!(partition.range(0), I..2 * I);
    }

    #[test]
    fn test_syndicated_detection() {
        let partition = IdSpacePartition::default();
        assert!(!partition.is_syndicated(999_999_999));
        assert!(partition.is_syndicated(1_000_000_000));
    }

    proptest! {
        #[test]
        fn prop_relative_offsets_are_multiples_of_increment(k in 1usize..64, increment in 1i64..10_000_000_000) {
            let partition = IdSpacePartition::new(increment, increment);
            let relative: Vec<i64> = (0..k).map(|i| partition.relative_offset(i)).collect();
            let expected: Vec<i64> = (0..k as i64).map(|i| i * increment).collect();
            prop_assert_eq!(relative, expected);
        }

        #[test]
        fn prop_ranges_never_overlap(k in 2usize..64, base in 1i64..1_000_000, increment in 1i64..1_000_000_000) {
            let partition = IdSpacePartition::new(base, increment);
            for i in 0..k - 1 {
                let current = partition.range(i);
                let next = partition.range(i + 1);
                prop_assert!(current.end <= next.start);
                prop_assert!(current.start < current.end);
            }
        }
    }
}
