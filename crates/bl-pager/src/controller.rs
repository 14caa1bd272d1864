//! PaginationController - forward/backward browsing over a non-seekable entity
//!
//! The broker can only peek forward from a sequence number, so pages are
//! fetched once and kept in an append-only cache:
//! - going back is a cache read and never touches the broker
//! - going forward re-reads a cached page when there is one, otherwise
//!   peeks from the cursor (or from the start on session-bearing entities)
//! - a fetch that brings nothing new triggers a dedup fallback scan
//!
//! One load runs at a time; a load requested while another is in flight is
//! dropped, not queued. Loading a first page starts a new context and
//! discards whatever an older load brings back.

use std::sync::Arc;

use bl_common::{
    EntityPath, ErrorClass, ExplorerError, MessageRecord, PagingConfig, PeekRequest, Result, StatusEvent,
    StatusSink,
};
use bl_ops::BrokerOperations;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{Page, PageCache, PaginationCursor};
use crate::projection::{Projection, SortOrder};
use crate::selection::Selection;

/// What is being browsed. Changing any part of it resets the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrowseContext {
    pub path: EntityPath,
    pub requires_session: bool,
}

impl BrowseContext {
    pub fn new(path: EntityPath, requires_session: bool) -> Self {
        Self { path, requires_session }
    }

    /// Dead-letter sub-queues are browsed without sessions
    pub fn uses_sessions(&self) -> bool {
        self.requires_session && !self.path.is_dead_letter()
    }

    fn peek(&self, count: usize, from_sequence: Option<i64>) -> PeekRequest {
        PeekRequest::new(self.path.clone(), count)
            .from_sequence(from_sequence)
            .requires_session(self.requires_session)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Fetched from the broker and stored
    Loaded { page: usize, count: usize },
    /// Served from the cache
    Cached { page: usize, count: usize },
    /// No further page exists
    Exhausted,
    /// Another load was in flight
    Dropped,
    /// Already on the first page
    NoPreviousPage,
    /// The context changed while the fetch was running
    Discarded,
}

/// Snapshot of the pager controls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub current_page: usize,
    pub can_go_next: bool,
    pub can_go_previous: bool,
    pub has_more: bool,
    pub load_state: LoadState,
    /// e.g. "Page 2 (101–200)"
    pub text: String,
}

#[derive(Default)]
struct PagerState {
    context: Option<BrowseContext>,
    /// Bumped on every context change
    generation: u64,
    /// Generation of the load in flight
    loading: Option<u64>,
    load_state: LoadState,
    cache: PageCache,
    cursor: PaginationCursor,
    projection: Projection,
    selection: Selection,
    /// Current page after projection
    view: Vec<MessageRecord>,
}

impl PagerState {
    fn current_page(&self) -> Option<Page> {
        self.cache.get(self.cursor.current_page)
    }

    fn refresh_view(&mut self) {
        self.view = match self.current_page() {
            Some(page) => self.projection.apply(&page),
            None => Vec::new(),
        };
    }

    fn show_page(&mut self, number: usize) {
        self.cursor.current_page = number;
        self.refresh_view();
    }

    fn finish_load(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.loading = None;
        true
    }
}

/// Everything a forward fetch needs, captured under the lock
struct ForwardFetch {
    context: BrowseContext,
    generation: u64,
    count: usize,
    from_sequence: Option<i64>,
}

pub struct PaginationController {
    operations: Arc<dyn BrokerOperations>,
    config: PagingConfig,
    status: Arc<dyn StatusSink>,
    state: Mutex<PagerState>,
}

impl PaginationController {
    pub fn new(operations: Arc<dyn BrokerOperations>, config: PagingConfig, status: Arc<dyn StatusSink>) -> Self {
        Self {
            operations,
            config,
            status,
            state: Mutex::new(PagerState::default()),
        }
    }

    /// Start browsing `context`: reset the cache, cursor and selection, then
    /// fetch page 1. Sort order and filter text carry over.
    pub async fn load_first_page(&self, context: BrowseContext) -> Result<LoadOutcome> {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.loading = Some(state.generation);
            state.load_state = LoadState::Loading;
            state.context = Some(context.clone());
            state.cache.clear();
            state.cursor.reset();
            state.selection.clear();
            state.view.clear();
            state.generation
        };
        info!(entity = %context.path, sessions = context.uses_sessions(), "Loading first page");

        let count = self.config.page_size.min(self.config.max_total_messages);
        let fetched = self.operations.peek_messages(&context.peek(count, None)).await;

        let mut state = self.state.lock();
        if !state.finish_load(generation) {
            debug!(entity = %context.path, "Discarding first page for a replaced context");
            return Ok(LoadOutcome::Discarded);
        }

        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                state.load_state = LoadState::Error(e.status_message());
                drop(state);
                return Err(self.report_failure(&context, e));
            }
        };

        let count = records.len();
        state.cursor.record_fetch(&records, self.config.max_total_messages);
        let page = state.cache.append(records);
        state.show_page(page);
        state.load_state = LoadState::Loaded;
        drop(state);

        self.page_loaded(&context, page, count);
        Ok(LoadOutcome::Loaded { page, count })
    }

    /// Show the next page, from the cache when possible
    pub async fn load_next_page(&self) -> Result<LoadOutcome> {
        let fetch = {
            let mut state = self.state.lock();
            let context = state.context.clone().ok_or(ExplorerError::NoContext)?;
            if state.loading.is_some() {
                debug!(entity = %context.path, "Load already in flight, dropping next-page request");
                return Ok(LoadOutcome::Dropped);
            }

            let next = state.cursor.current_page + 1;
            if let Some(page) = state.cache.get(next) {
                state.show_page(next);
                return Ok(LoadOutcome::Cached { page: next, count: page.len() });
            }

            let count = state
                .cursor
                .fetch_budget(self.config.page_size, self.config.max_total_messages);
            if !state.cursor.has_more || count == 0 {
                state.cursor.has_more = false;
                return Ok(LoadOutcome::Exhausted);
            }

            let from_sequence = if context.uses_sessions() {
                None
            } else {
                state.cursor.next_from_sequence
            };
            state.loading = Some(state.generation);
            state.load_state = LoadState::Loading;
            ForwardFetch {
                context,
                generation: state.generation,
                count,
                from_sequence,
            }
        };

        let fetched = self.fetch_forward(&fetch).await;

        let mut state = self.state.lock();
        if !state.finish_load(fetch.generation) {
            debug!(entity = %fetch.context.path, "Discarding next page for a replaced context");
            return Ok(LoadOutcome::Discarded);
        }

        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                state.load_state = LoadState::Error(e.status_message());
                drop(state);
                return Err(self.report_failure(&fetch.context, e));
            }
        };

        state.load_state = LoadState::Loaded;
        if records.is_empty() {
            state.cursor.has_more = false;
            drop(state);
            info!(entity = %fetch.context.path, "No more messages");
            self.status.notify(StatusEvent::Info("No more messages".to_string()));
            return Ok(LoadOutcome::Exhausted);
        }

        let count = records.len();
        state.cursor.record_fetch(&records, self.config.max_total_messages);
        let page = state.cache.append(records);
        state.show_page(page);
        drop(state);

        self.page_loaded(&fetch.context, page, count);
        Ok(LoadOutcome::Loaded { page, count })
    }

    /// Step back one page. Never calls the broker.
    pub fn load_previous_page(&self) -> Result<LoadOutcome> {
        let mut state = self.state.lock();
        if state.context.is_none() {
            return Err(ExplorerError::NoContext);
        }
        if state.loading.is_some() {
            return Ok(LoadOutcome::Dropped);
        }

        let current = state.cursor.current_page;
        if current <= 1 {
            return Ok(LoadOutcome::NoPreviousPage);
        }

        let previous = current - 1;
        let count = state.cache.get(previous).map(|p| p.len()).unwrap_or(0);
        state.show_page(previous);
        Ok(LoadOutcome::Cached { page: previous, count })
    }

    /// Fetch new records for the next page. Returns only records whose
    /// sequence numbers are not cached yet; empty means no further page.
    async fn fetch_forward(&self, fetch: &ForwardFetch) -> Result<Vec<MessageRecord>> {
        let context = &fetch.context;
        let fetched = self
            .operations
            .peek_messages(&context.peek(fetch.count, fetch.from_sequence))
            .await?;

        // Only session fetches get the fallback scan on an empty result; the
        // cursor is authoritative otherwise, so empty means the end
        if fetched.is_empty() && !context.uses_sessions() {
            return Ok(Vec::new());
        }

        let fresh = self.without_cached(fetched);
        if !fresh.is_empty() {
            return Ok(fresh);
        }

        // Nothing new came back: rescan from the start past everything cached
        let cached_total = self.state.lock().cache.total_messages();
        debug!(
            entity = %context.path,
            scan = cached_total + self.config.page_size,
            "Fetch returned only cached messages, running fallback scan"
        );
        let rescanned = self
            .operations
            .peek_messages(&context.peek(cached_total + self.config.page_size, None))
            .await?;

        let mut fresh = self.without_cached(rescanned);
        fresh.truncate(fetch.count);
        Ok(fresh)
    }

    fn without_cached(&self, records: Vec<MessageRecord>) -> Vec<MessageRecord> {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        records
            .into_iter()
            .filter(|r| !state.cache.contains_sequence(r.sequence_number) && seen.insert(r.sequence_number))
            .collect()
    }

    fn page_loaded(&self, context: &BrowseContext, page: usize, count: usize) {
        debug!(entity = %context.path, page = page, count = count, "Page stored");
        self.status.notify(StatusEvent::PageLoaded {
            path: context.path.to_string(),
            page,
            count,
        });
    }

    fn report_failure(&self, context: &BrowseContext, e: ExplorerError) -> ExplorerError {
        match e.class() {
            ErrorClass::Unexpected => error!(entity = %context.path, error = %e, "Page load failed"),
            _ => warn!(entity = %context.path, error = %e, "Page load failed"),
        }
        self.status.notify(StatusEvent::Error(e.status_message()));
        e
    }

    // ------------------------------------------------------------------------
    // Host-facing state
    // ------------------------------------------------------------------------

    pub fn context(&self) -> Option<BrowseContext> {
        self.state.lock().context.clone()
    }

    /// Stored page `number`, unaffected by sort and filter
    pub fn get_page(&self, number: usize) -> Option<Page> {
        self.state.lock().cache.get(number)
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().cache.page_count()
    }

    /// Current page as fetched
    pub fn current_page_messages(&self) -> Vec<MessageRecord> {
        self.state
            .lock()
            .current_page()
            .map(|p| p.to_vec())
            .unwrap_or_default()
    }

    /// Current page after sort and filter
    pub fn filtered_view(&self) -> Vec<MessageRecord> {
        self.state.lock().view.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().loading.is_some()
    }

    pub fn sort_order(&self) -> SortOrder {
        self.state.lock().projection.sort()
    }

    pub fn set_sort_order(&self, sort: SortOrder) {
        let mut state = self.state.lock();
        state.projection.set_sort(sort);
        state.refresh_view();
    }

    pub fn toggle_sort_order(&self) -> SortOrder {
        let mut state = self.state.lock();
        let sort = state.projection.sort().toggled();
        state.projection.set_sort(sort);
        state.refresh_view();
        sort
    }

    pub fn set_filter(&self, text: &str) {
        let mut state = self.state.lock();
        state.projection.set_filter(text);
        state.refresh_view();
    }

    pub fn toggle_selection(&self, sequence_number: i64) -> bool {
        self.state.lock().selection.toggle(sequence_number)
    }

    /// Select every message visible after filtering
    pub fn select_all_on_page(&self) {
        let mut state = self.state.lock();
        let PagerState { selection, view, .. } = &mut *state;
        selection.select_all(view.iter());
    }

    pub fn clear_selection(&self) {
        self.state.lock().selection.clear();
    }

    pub fn selected_sequence_numbers(&self) -> Vec<i64> {
        self.state.lock().selection.sequence_numbers()
    }

    /// Selected messages that are still in the cache, ascending
    pub fn selected_messages(&self) -> Vec<MessageRecord> {
        let state = self.state.lock();
        state
            .selection
            .sequence_numbers()
            .into_iter()
            .filter_map(|seq| state.cache.find(seq).cloned())
            .collect()
    }

    pub fn pagination(&self) -> PaginationState {
        let state = self.state.lock();
        let current = state.cursor.current_page;
        let can_go_next = state.cache.get(current + 1).is_some() || (current > 0 && state.cursor.has_more);
        let text = if current == 0 {
            String::new()
        } else {
            let count = state.cache.get(current).map(|p| p.len()).unwrap_or(0);
            let before = state.cache.messages_before(current);
            if count == 0 {
                format!("Page {} (0–0)", current)
            } else {
                format!("Page {} ({}–{})", current, before + 1, before + count)
            }
        };

        PaginationState {
            current_page: current,
            can_go_next,
            can_go_previous: current > 1,
            has_more: state.cursor.has_more,
            load_state: state.load_state.clone(),
            text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bl_broker::{InMemoryBroker, OutgoingMessage};
    use bl_common::{
        BulkOperationResult, ChannelStatusSink, ExplorerConfig, MessageConfiguration, NullStatusSink, QueueInfo,
        SubscriptionInfo, TopicInfo,
    };
    use bl_ops::{connect, AuthKind, AuthMode};
    use bl_pool::ConnectionPool;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    fn paging(page_size: usize, max_total_messages: usize) -> PagingConfig {
        PagingConfig {
            page_size,
            max_total_messages,
        }
    }

    async fn operations(broker: &InMemoryBroker) -> Arc<dyn BrokerOperations> {
        connect(
            AuthMode::SharedSecret {
                connection_string: "Endpoint=sb://local/;SharedAccessKey=k".to_string(),
            },
            Arc::new(broker.clone()),
            Arc::new(ConnectionPool::new()),
            &ExplorerConfig::default(),
            Arc::new(NullStatusSink),
        )
        .await
        .unwrap()
    }

    fn queue_with(count: usize) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        for i in 1..=count {
            broker.enqueue("orders", OutgoingMessage::new(format!("order {}", i))).unwrap();
        }
        broker
    }

    fn session_queue(sessions: &[(&str, usize)]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_queue("jobs", true);
        for (sid, count) in sessions {
            for i in 0..*count {
                let mut message = OutgoingMessage::new(format!("{} {}", sid, i));
                message.session_id = Some(sid.to_string());
                broker.enqueue("jobs", message).unwrap();
            }
        }
        broker
    }

    fn seqs(records: &[MessageRecord]) -> Vec<i64> {
        records.iter().map(|r| r.sequence_number).collect()
    }

    fn orders() -> BrowseContext {
        BrowseContext::new(EntityPath::queue("orders"), false)
    }

    async fn controller(broker: &InMemoryBroker, config: PagingConfig) -> PaginationController {
        PaginationController::new(operations(broker).await, config, Arc::new(NullStatusSink))
    }

    #[tokio::test]
    async fn test_pages_through_seven_messages() {
        let broker = queue_with(7);
        let pager = controller(&broker, paging(3, 5000)).await;

        assert_eq!(pager.load_first_page(orders()).await.unwrap(), LoadOutcome::Loaded { page: 1, count: 3 });
        assert_eq!(seqs(&pager.current_page_messages()), vec![1, 2, 3]);

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Loaded { page: 2, count: 3 });
        assert_eq!(seqs(&pager.current_page_messages()), vec![4, 5, 6]);

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Loaded { page: 3, count: 1 });
        assert_eq!(seqs(&pager.current_page_messages()), vec![7]);
        assert!(pager.pagination().has_more);

        // The empty probe past the end is a single peek with no fallback scan
        let peeks = broker.stats().peek_calls;
        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Exhausted);
        assert_eq!(broker.stats().peek_calls, peeks + 1);
        let state = pager.pagination();
        assert!(!state.has_more);
        assert!(!state.can_go_next);
        assert_eq!(state.current_page, 3);
        assert_eq!(state.text, "Page 3 (7–7)");
        assert_eq!(pager.page_count(), 3);
    }

    #[tokio::test]
    async fn test_next_page_starts_past_previous_max() {
        let broker = queue_with(20);
        let pager = controller(&broker, paging(4, 5000)).await;
        pager.load_first_page(orders()).await.unwrap();

        let mut previous_max = 4;
        while let LoadOutcome::Loaded { .. } = pager.load_next_page().await.unwrap() {
            let page = pager.current_page_messages();
            assert!(page.iter().all(|r| r.sequence_number >= previous_max + 1));
            previous_max = page.iter().map(|r| r.sequence_number).max().unwrap();
        }
        assert_eq!(previous_max, 20);
    }

    #[tokio::test]
    async fn test_previous_page_never_peeks() {
        let broker = queue_with(9);
        let pager = controller(&broker, paging(3, 5000)).await;
        pager.load_first_page(orders()).await.unwrap();
        pager.load_next_page().await.unwrap();
        pager.load_next_page().await.unwrap();
        let peeks = broker.stats().peek_calls;

        assert_eq!(pager.load_previous_page().unwrap(), LoadOutcome::Cached { page: 2, count: 3 });
        assert_eq!(pager.load_previous_page().unwrap(), LoadOutcome::Cached { page: 1, count: 3 });
        assert_eq!(pager.load_previous_page().unwrap(), LoadOutcome::NoPreviousPage);
        assert_eq!(seqs(&pager.current_page_messages()), vec![1, 2, 3]);

        // Forward again over cached pages
        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Cached { page: 2, count: 3 });
        assert_eq!(broker.stats().peek_calls, peeks);
    }

    #[tokio::test]
    async fn test_stored_pages_are_stable() {
        let broker = queue_with(6);
        let pager = controller(&broker, paging(3, 5000)).await;
        pager.load_first_page(orders()).await.unwrap();
        let first = pager.get_page(1).unwrap();

        // New messages arriving at the head do not change stored pages
        broker.enqueue("orders", OutgoingMessage::new("late arrival")).unwrap();
        pager.load_next_page().await.unwrap();
        pager.load_previous_page().unwrap();

        assert_eq!(pager.get_page(1).unwrap(), first);
        assert_eq!(pager.get_page(1).unwrap(), pager.get_page(1).unwrap());
    }

    #[tokio::test]
    async fn test_max_total_caps_fetches() {
        let broker = queue_with(10);
        let pager = controller(&broker, paging(4, 6)).await;
        pager.load_first_page(orders()).await.unwrap();

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Loaded { page: 2, count: 2 });
        assert!(!pager.pagination().has_more);
        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Exhausted);
    }

    #[tokio::test]
    async fn test_empty_entity() {
        let broker = queue_with(0);
        let pager = controller(&broker, paging(3, 5000)).await;

        assert_eq!(pager.load_first_page(orders()).await.unwrap(), LoadOutcome::Loaded { page: 1, count: 0 });
        let state = pager.pagination();
        assert!(!state.has_more);
        assert!(!state.can_go_next);
        assert_eq!(state.text, "Page 1 (0–0)");

        let peeks = broker.stats().peek_calls;
        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Exhausted);
        assert_eq!(broker.stats().peek_calls, peeks);
    }

    #[tokio::test]
    async fn test_session_fallback_reaches_unseen_messages() {
        // Session peeks always start over, so page 2 resurfaces page 1
        let broker = session_queue(&[("a", 3), ("b", 3)]);
        let pager = controller(&broker, paging(3, 5000)).await;
        let context = BrowseContext::new(EntityPath::queue("jobs"), true);

        pager.load_first_page(context).await.unwrap();
        assert_eq!(seqs(&pager.current_page_messages()), vec![1, 2, 3]);

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Loaded { page: 2, count: 3 });
        assert_eq!(seqs(&pager.current_page_messages()), vec![4, 5, 6]);

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Exhausted);
        assert!(!pager.pagination().has_more);
    }

    #[tokio::test]
    async fn test_session_pages_never_repeat_sequence_numbers() {
        let broker = session_queue(&[("a", 2), ("b", 4), ("c", 3)]);
        let pager = controller(&broker, paging(2, 5000)).await;
        pager
            .load_first_page(BrowseContext::new(EntityPath::queue("jobs"), true))
            .await
            .unwrap();

        let mut seen: Vec<i64> = seqs(&pager.current_page_messages());
        while let LoadOutcome::Loaded { .. } = pager.load_next_page().await.unwrap() {
            for seq in seqs(&pager.current_page_messages()) {
                assert!(!seen.contains(&seq), "sequence {} resurfaced", seq);
                seen.push(seq);
            }
        }
        seen.sort();
        assert_eq!(seen, (1..=9).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_dead_letter_of_session_queue_uses_cursor() {
        let broker = session_queue(&[("a", 4)]);
        for seq in 1..=4 {
            broker.dead_letter("jobs", seq, "Bad", None);
        }
        let pager = controller(&broker, paging(2, 5000)).await;
        let context = BrowseContext::new(EntityPath::queue("jobs").dead_letter(), true);
        assert!(!context.uses_sessions());

        pager.load_first_page(context).await.unwrap();
        pager.load_next_page().await.unwrap();
        assert_eq!(seqs(&pager.current_page_messages()), vec![3, 4]);
        assert_eq!(broker.stats().session_accepts, 0);
    }

    #[tokio::test]
    async fn test_sort_and_filter_do_not_fetch() {
        let broker = queue_with(3);
        broker
            .enqueue("orders", {
                let mut m = OutgoingMessage::new("refund");
                m.subject = Some("Refund.Issued".to_string());
                m
            })
            .unwrap();
        let pager = controller(&broker, paging(10, 5000)).await;
        pager.load_first_page(orders()).await.unwrap();
        let peeks = broker.stats().peek_calls;

        assert_eq!(pager.toggle_sort_order(), SortOrder::Descending);
        assert_eq!(seqs(&pager.filtered_view()), vec![4, 3, 2, 1]);
        assert_eq!(seqs(&pager.current_page_messages()), vec![1, 2, 3, 4]);

        pager.set_filter("REFUND");
        assert_eq!(seqs(&pager.filtered_view()), vec![4]);

        pager.set_sort_order(SortOrder::Ascending);
        pager.set_filter("order");
        assert_eq!(seqs(&pager.filtered_view()), vec![1, 2, 3]);
        assert_eq!(broker.stats().peek_calls, peeks);
    }

    #[tokio::test]
    async fn test_filter_carries_across_pages() {
        let broker = queue_with(6);
        let pager = controller(&broker, paging(3, 5000)).await;
        pager.set_filter("order 5");
        pager.load_first_page(orders()).await.unwrap();
        assert!(pager.filtered_view().is_empty());

        pager.load_next_page().await.unwrap();
        assert_eq!(seqs(&pager.filtered_view()), vec![5]);
    }

    #[tokio::test]
    async fn test_selection_spans_pages_and_resets_with_context() {
        let broker = queue_with(6);
        let pager = controller(&broker, paging(3, 5000)).await;
        pager.load_first_page(orders()).await.unwrap();
        pager.toggle_selection(2);
        pager.load_next_page().await.unwrap();
        pager.select_all_on_page();

        assert_eq!(pager.selected_sequence_numbers(), vec![2, 4, 5, 6]);
        assert_eq!(seqs(&pager.selected_messages()), vec![2, 4, 5, 6]);

        pager.load_first_page(orders()).await.unwrap();
        assert!(pager.selected_sequence_numbers().is_empty());
    }

    #[tokio::test]
    async fn test_pagination_text() {
        let broker = queue_with(5);
        let pager = controller(&broker, paging(2, 5000)).await;
        assert_eq!(pager.pagination().text, "");

        pager.load_first_page(orders()).await.unwrap();
        pager.load_next_page().await.unwrap();
        let state = pager.pagination();
        assert_eq!(state.text, "Page 2 (3–4)");
        assert!(state.can_go_previous);
        assert!(state.can_go_next);
        assert_eq!(state.load_state, LoadState::Loaded);
    }

    #[tokio::test]
    async fn test_next_without_context() {
        let broker = queue_with(1);
        let pager = controller(&broker, paging(2, 5000)).await;
        assert!(matches!(pager.load_next_page().await, Err(ExplorerError::NoContext)));
        assert!(matches!(pager.load_previous_page(), Err(ExplorerError::NoContext)));
    }

    #[tokio::test]
    async fn test_load_failure_reports_status() {
        let broker = queue_with(1);
        let (sink, mut events) = ChannelStatusSink::new();
        let pager = PaginationController::new(operations(&broker).await, paging(2, 5000), Arc::new(sink));

        let result = pager
            .load_first_page(BrowseContext::new(EntityPath::queue("missing"), false))
            .await;

        assert!(result.is_err());
        assert!(matches!(pager.pagination().load_state, LoadState::Error(_)));
        assert!(!pager.is_busy());
        assert_eq!(
            events.try_recv().unwrap(),
            StatusEvent::Error("Entity not found: missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_page_loaded_event() {
        let broker = queue_with(2);
        let (sink, mut events) = ChannelStatusSink::new();
        let pager = PaginationController::new(operations(&broker).await, paging(5, 5000), Arc::new(sink));
        pager.load_first_page(orders()).await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            StatusEvent::PageLoaded {
                path: "orders".to_string(),
                page: 1,
                count: 2,
            }
        );
    }

    /// Holds every peek until released
    struct GatedOperations {
        inner: Arc<dyn BrokerOperations>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl BrokerOperations for GatedOperations {
        fn auth_kind(&self) -> AuthKind {
            self.inner.auth_kind()
        }

        fn namespace(&self) -> &str {
            self.inner.namespace()
        }

        async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
            self.inner.list_queues().await
        }

        async fn list_topics(&self) -> Result<Vec<TopicInfo>> {
            self.inner.list_topics().await
        }

        async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>> {
            self.inner.list_subscriptions(topic).await
        }

        async fn peek_messages(&self, request: &PeekRequest) -> Result<Vec<MessageRecord>> {
            self.gate.notified().await;
            self.inner.peek_messages(request).await
        }

        async fn send_message(&self, entity: &str, body: Vec<u8>, configuration: &MessageConfiguration) -> Result<()> {
            self.inner.send_message(entity, body, configuration).await
        }

        async fn purge_messages(&self, path: &EntityPath, cancel: &CancellationToken) -> Result<BulkOperationResult> {
            self.inner.purge_messages(path, cancel).await
        }

        async fn delete_messages(
            &self,
            path: &EntityPath,
            sequence_numbers: &[i64],
            cancel: &CancellationToken,
        ) -> Result<BulkOperationResult> {
            self.inner.delete_messages(path, sequence_numbers, cancel).await
        }

        async fn resend_messages(
            &self,
            entity: &str,
            messages: &[MessageRecord],
            cancel: &CancellationToken,
        ) -> Result<BulkOperationResult> {
            self.inner.resend_messages(entity, messages, cancel).await
        }

        async fn resubmit_dead_letter_messages(
            &self,
            path: &EntityPath,
            sequence_numbers: &[i64],
            cancel: &CancellationToken,
        ) -> Result<BulkOperationResult> {
            self.inner.resubmit_dead_letter_messages(path, sequence_numbers, cancel).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn gated(broker: &InMemoryBroker, config: PagingConfig) -> (Arc<PaginationController>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let operations = Arc::new(GatedOperations {
            inner: operations(broker).await,
            gate: gate.clone(),
        });
        let pager = Arc::new(PaginationController::new(operations, config, Arc::new(NullStatusSink)));
        (pager, gate)
    }

    async fn wait_until_busy(pager: &PaginationController) {
        while !pager.is_busy() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_next_page_is_dropped() {
        let broker = queue_with(9);
        let (pager, gate) = gated(&broker, paging(3, 5000)).await;

        gate.notify_one();
        pager.load_first_page(orders()).await.unwrap();

        let in_flight = {
            let pager = pager.clone();
            tokio::spawn(async move { pager.load_next_page().await })
        };
        // Only the spawned load sets the busy flag
        wait_until_busy(&pager).await;

        assert_eq!(pager.load_next_page().await.unwrap(), LoadOutcome::Dropped);
        assert_eq!(pager.load_previous_page().unwrap(), LoadOutcome::Dropped);

        gate.notify_one();
        assert_eq!(in_flight.await.unwrap().unwrap(), LoadOutcome::Loaded { page: 2, count: 3 });
        assert_eq!(pager.page_count(), 2);
    }

    #[tokio::test]
    async fn test_context_change_discards_in_flight_load() {
        let broker = queue_with(9);
        broker.create_queue("invoices", false);
        broker.enqueue("invoices", OutgoingMessage::new("invoice")).unwrap();
        let (pager, gate) = gated(&broker, paging(3, 5000)).await;

        gate.notify_one();
        pager.load_first_page(orders()).await.unwrap();

        let stale = {
            let pager = pager.clone();
            tokio::spawn(async move { pager.load_next_page().await })
        };
        wait_until_busy(&pager).await;

        let fresh = {
            let pager = pager.clone();
            tokio::spawn(async move {
                pager
                    .load_first_page(BrowseContext::new(EntityPath::queue("invoices"), false))
                    .await
            })
        };

        // Release both peeks
        gate.notify_one();
        gate.notify_one();
        assert_eq!(stale.await.unwrap().unwrap(), LoadOutcome::Discarded);
        assert_eq!(fresh.await.unwrap().unwrap(), LoadOutcome::Loaded { page: 1, count: 1 });

        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.context().unwrap().path, EntityPath::queue("invoices"));
        assert!(!pager.is_busy());
    }
}
