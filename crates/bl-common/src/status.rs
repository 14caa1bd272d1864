//! Status notifications from the core to the host.
//!
//! The core calls a [`StatusSink`] synchronously; the host decides how the
//! event reaches its UI thread.

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{BulkOperationKind, BulkOperationResult};

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Info(String),
    Error(String),
    PageLoaded {
        path: String,
        page: usize,
        count: usize,
    },
    BulkProgress {
        kind: BulkOperationKind,
        completed: usize,
        requested: usize,
    },
    BulkFinished(BulkOperationResult),
}

pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn notify(&self, event: StatusEvent) {
        match event {
            StatusEvent::Info(message) => info!("{}", message),
            StatusEvent::Error(message) => error!("{}", message),
            StatusEvent::PageLoaded { path, page, count } => {
                info!(entity = %path, page = page, count = count, "Page loaded");
            }
            StatusEvent::BulkProgress { kind, completed, requested } => {
                info!(operation = kind.as_str(), completed = completed, requested = requested, "Bulk progress");
            }
            StatusEvent::BulkFinished(result) => {
                info!(operation = result.kind.as_str(), "{}", result.summary());
            }
        }
    }
}

/// Forwards events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn notify(&self, event: StatusEvent) {
        // A closed receiver means the host is gone; nothing left to tell.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn notify(&self, _event: StatusEvent) {}
}
