//! Messages the user has ticked for a bulk operation, by sequence number

use std::collections::BTreeSet;

use bl_common::MessageRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    selected: BTreeSet<i64>,
}

impl Selection {
    /// Returns whether the message is selected afterwards
    pub fn toggle(&mut self, sequence_number: i64) -> bool {
        if self.selected.remove(&sequence_number) {
            false
        } else {
            self.selected.insert(sequence_number);
            true
        }
    }

    pub fn select_all<'a>(&mut self, records: impl IntoIterator<Item = &'a MessageRecord>) {
        self.selected.extend(records.into_iter().map(|r| r.sequence_number));
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn contains(&self, sequence_number: i64) -> bool {
        self.selected.contains(&sequence_number)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Ascending
    pub fn sequence_numbers(&self) -> Vec<i64> {
        self.selected.iter().copied().collect()
    }
}
