//! Sort and filter applied to the page on screen

use bl_common::MessageRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}

/// Enqueue-time sort plus free-text filter. Works on one materialized page
/// and never causes a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    sort: SortOrder,
    /// Lowercased filter text
    needle: String,
}

impl Projection {
    pub fn sort(&self) -> SortOrder {
        self.sort
    }

    pub fn set_sort(&mut self, sort: SortOrder) {
        self.sort = sort;
    }

    pub fn filter(&self) -> &str {
        &self.needle
    }

    pub fn set_filter(&mut self, text: &str) {
        self.needle = text.trim().to_lowercase();
    }

    pub fn apply(&self, page: &[MessageRecord]) -> Vec<MessageRecord> {
        let mut view: Vec<MessageRecord> = page
            .iter()
            .filter(|r| r.matches_filter(&self.needle))
            .cloned()
            .collect();

        view.sort_by(|a, b| {
            a.enqueued_time
                .cmp(&b.enqueued_time)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });
        if self.sort == SortOrder::Descending {
            view.reverse();
        }
        view
    }
}
