//! Append-only page cache and the forward cursor

use std::collections::HashSet;
use std::sync::Arc;

use bl_common::MessageRecord;

/// One stored page. Shared with the host, never mutated.
pub type Page = Arc<[MessageRecord]>;

/// Pages numbered contiguously from 1, plus every sequence number they hold
#[derive(Debug, Default)]
pub struct PageCache {
    pages: Vec<Page>,
    sequence_numbers: HashSet<i64>,
    total_messages: usize,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.sequence_numbers.clear();
        self.total_messages = 0;
    }

    /// Store the next page and return its number
    pub fn append(&mut self, records: Vec<MessageRecord>) -> usize {
        self.sequence_numbers.extend(records.iter().map(|r| r.sequence_number));
        self.total_messages += records.len();
        self.pages.push(records.into());
        self.pages.len()
    }

    /// Page `number` (1-based)
    pub fn get(&self, number: usize) -> Option<Page> {
        number.checked_sub(1).and_then(|i| self.pages.get(i)).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn total_messages(&self) -> usize {
        self.total_messages
    }

    pub fn contains_sequence(&self, sequence_number: i64) -> bool {
        self.sequence_numbers.contains(&sequence_number)
    }

    /// Messages on the pages before `number`
    pub fn messages_before(&self, number: usize) -> usize {
        self.pages.iter().take(number.saturating_sub(1)).map(|p| p.len()).sum()
    }

    pub fn find(&self, sequence_number: i64) -> Option<&MessageRecord> {
        if !self.contains_sequence(sequence_number) {
            return None;
        }
        self.pages
            .iter()
            .flat_map(|p| p.iter())
            .find(|r| r.sequence_number == sequence_number)
    }
}

/// Where the next forward fetch starts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationCursor {
    /// 0 before the first page is stored
    pub current_page: usize,
    /// Inclusive start of the next fetch on entities without sessions
    pub next_from_sequence: Option<i64>,
    pub has_more: bool,
    /// Messages held by the cache
    pub cumulative: usize,
}

impl PaginationCursor {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a freshly fetched page. More pages are assumed to exist
    /// whenever the page was non-empty and the cap is not reached yet.
    pub fn record_fetch(&mut self, page: &[MessageRecord], max_total: usize) {
        self.cumulative += page.len();
        if let Some(max) = page.iter().map(|r| r.sequence_number).max() {
            self.next_from_sequence = Some(max + 1);
        }
        self.has_more = !page.is_empty() && self.cumulative < max_total;
    }

    /// How many messages the next fetch may ask for
    pub fn fetch_budget(&self, page_size: usize, max_total: usize) -> usize {
        page_size.min(max_total.saturating_sub(self.cumulative))
    }
}
