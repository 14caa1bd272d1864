//! Paged browsing over broker entities
//!
//! - `cache`: append-only page store and the forward cursor
//! - `projection`: client-side sort and filter of one page
//! - `selection`: sequence numbers picked for bulk operations
//! - `controller`: ties them to a [`bl_ops::BrokerOperations`] facade

pub mod cache;
pub mod controller;
pub mod projection;
pub mod selection;

pub use cache::{Page, PageCache, PaginationCursor};
pub use controller::{BrowseContext, LoadOutcome, LoadState, PaginationController, PaginationState};
pub use projection::{Projection, SortOrder};
pub use selection::Selection;
