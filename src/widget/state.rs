use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{Category, WidgetConfig};
use crate::store::{Snapshot, COUNT_FIELD};

/// Two-phase vote state: votes are accepted, then the widget cools down for
/// a fixed window before accepting the next one. The transition back is
/// timer-driven, independent of whether the remote write has settled.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VotePhase {
    Accepting,
    CoolingDown,
}

impl Default for VotePhase {
    fn default() -> Self {
        VotePhase::Accepting
    }
}

/// Transient "+1" notice shown right after a vote.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Popup {
    pub category: Category,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetState {
    pub counts: BTreeMap<Category, u64>,
    pub phase: VotePhase,
    pub popup: Option<Popup>,
}

impl WidgetState {
    pub fn new(config: &WidgetConfig) -> Self {
        let counts = config
            .categories
            .iter()
            .map(|&category| (category, 0))
            .collect();

        Self {
            counts,
            phase: VotePhase::Accepting,
            popup: None,
        }
    }

    /// Merges a snapshot over the current counts: documents present in the
    /// snapshot replace their entries, configured categories absent from it
    /// keep their last known value.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        for document in snapshot.documents() {
            if let Some(category) = Category::from_id(&document.id) {
                if self.counts.contains_key(&category) {
                    let count = document.number(COUNT_FIELD).max(0) as u64;
                    self.counts.insert(category, count);
                }
            }
        }
    }

    pub fn count(&self, category: Category) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }
}
