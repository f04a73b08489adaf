//! Property-based test generators using proptest.

use proptest::prelude::*;

/// A write against one entity's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexAction {
    /// Store `value` under `id`.
    Store {
        /// Record id.
        id: u64,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Delete `id`.
    Delete {
        /// Record id.
        id: u64,
    },
}

impl IndexAction {
    /// The record this action touches.
    pub fn id(&self) -> u64 {
        match self {
            Self::Store { id, .. } | Self::Delete { id } => *id,
        }
    }
}

/// Strategy for record values.
pub fn value_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Strategy for valid entity and index names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for a single action on ids `1..=max_id`.
///
/// Stores are three times as likely as deletes; small id ranges make
/// overwrites and delete-then-store common.
pub fn index_action_strategy(max_id: u64) -> impl Strategy<Value = IndexAction> {
    prop_oneof![
        3 => (1..=max_id, value_strategy(16)).prop_map(|(id, value)| IndexAction::Store { id, value }),
        1 => (1..=max_id).prop_map(|id| IndexAction::Delete { id }),
    ]
}

/// Strategy for action sequences.
pub fn index_actions_strategy(max_id: u64, max_len: usize) -> impl Strategy<Value = Vec<IndexAction>> {
    prop::collection::vec(index_action_strategy(max_id), 0..=max_len)
}

/// Strategy for a payload big enough to span several chunks of
/// `chunk_size` bytes.
pub fn multi_chunk_value_strategy(chunk_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), chunk_size * 2 + 1..=chunk_size * 5)
}
