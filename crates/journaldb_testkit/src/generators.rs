//! Property-based test generators using proptest.
//!
//! Provides strategies for journal keys, symbols and write schedules.

use journaldb_storage::{JournalKey, PartitionType};
use proptest::prelude::*;

/// Strategy for partition types.
pub fn partition_type_strategy() -> impl Strategy<Value = PartitionType> {
    prop_oneof![
        Just(PartitionType::None),
        Just(PartitionType::Day),
        Just(PartitionType::Month),
        Just(PartitionType::Year),
    ]
}

/// Strategy for journal keys, with or without a location.
pub fn journal_key_strategy() -> impl Strategy<Value = JournalKey> {
    (
        prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex"),
        prop::option::of(prop::string::string_regex("[a-z]{1,8}/[a-z]{1,8}").expect("Invalid regex")),
        partition_type_strategy(),
    )
        .prop_map(|(name, location, partition_type)| {
            let key = JournalKey::new(name, partition_type);
            match location {
                Some(location) => key.with_location(location),
                None => key,
            }
        })
}

/// Strategy for symbol values, including multi-byte UTF-8.
pub fn symbol_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => prop::string::string_regex("[A-Z]{1,4}(\\.[A-Z])?").expect("Invalid regex"),
        1 => prop::string::string_regex("[äöüßé€日本]{1,6}").expect("Invalid regex"),
        1 => Just(String::new()),
    ]
}

/// One server-side write between replication cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBatch {
    /// Quotes to append.
    pub rows: u64,
    /// Whether the batch is committed or rolled back.
    pub commit: bool,
}

/// Strategy for a single write batch. Most batches commit.
pub fn write_batch_strategy() -> impl Strategy<Value = WriteBatch> {
    (0u64..120, prop::bool::weighted(0.8)).prop_map(|(rows, commit)| WriteBatch { rows, commit })
}

/// Strategy for a schedule of write batches.
pub fn write_schedule_strategy(max_batches: usize) -> impl Strategy<Value = Vec<WriteBatch>> {
    prop::collection::vec(write_batch_strategy(), 1..max_batches.max(2))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn journal_key_name_starts_with_letter(key in journal_key_strategy()) {
            let first = key.name.chars().next();
            prop_assert!(first.map_or(false, |c| c.is_ascii_lowercase()));
        }

        #[test]
        fn schedules_are_never_empty(schedule in write_schedule_strategy(5)) {
            prop_assert!(!schedule.is_empty());
            prop_assert!(schedule.len() < 5);
        }
    }
}
