//! BusLens development host
//!
//! Seeds the in-memory broker and drives the core the way a desktop shell
//! would:
//! - browse pages with sort and filter
//! - purge, delete, resend and resubmit selected messages
//! - list entities with their counts

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bl_broker::{InMemoryBroker, NamedCredential, OutgoingMessage};
use bl_common::logging::init_logging;
use bl_common::{BulkOperationResult, EntityPath, ExplorerConfig, PeekRequest, TracingStatusSink};
use bl_ops::{connect, AuthMode, BrokerOperations};
use bl_pager::{BrowseContext, LoadOutcome, PaginationController, SortOrder};
use bl_pool::ConnectionPool;

const NAMESPACE: &str = "local.servicebus.test";

/// BusLens Development Host
#[derive(Parser, Debug)]
#[command(name = "bl-dev")]
#[command(about = "Browse and mutate a seeded in-memory broker")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "BUSLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Queue to seed and operate on
    #[arg(long, default_value = "orders")]
    queue: String,

    /// Messages to seed
    #[arg(long, default_value = "25")]
    messages: usize,

    /// Spread messages over this many sessions (0 = plain queue)
    #[arg(long, default_value = "0")]
    sessions: usize,

    /// Move the first N seeded messages to the dead-letter sub-queue
    #[arg(long, default_value = "0")]
    dead_lettered: usize,

    /// Connect with a delegated credential instead of a connection string
    #[arg(long)]
    delegated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List queues, topics and subscriptions
    Entities {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Page forward through the queue
    Browse {
        #[arg(long, default_value = "3")]
        pages: usize,

        /// Case-insensitive filter over id, body, correlation id, subject and reason
        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        descending: bool,

        /// Browse the dead-letter sub-queue
        #[arg(long)]
        dead_letter: bool,
    },

    /// Remove every message
    Purge {
        #[arg(long)]
        dead_letter: bool,
    },

    /// Remove the given sequence numbers
    Delete {
        #[arg(long, value_delimiter = ',', required = true)]
        seq: Vec<i64>,

        #[arg(long)]
        dead_letter: bool,
    },

    /// Send copies of the given messages back to the queue
    Resend {
        #[arg(long, value_delimiter = ',', required = true)]
        seq: Vec<i64>,
    },

    /// Move dead-lettered messages back to the queue
    Resubmit {
        #[arg(long, value_delimiter = ',', required = true)]
        seq: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = bl_config::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging);

    info!("Starting BusLens dev host");

    let broker = seed(&args)?;
    let operations = open(&args, &broker, &config).await?;

    let outcome = run(&args, operations.clone(), &config).await;
    operations.close().await;
    outcome?;

    let stats = broker.stats();
    info!(
        peeks = stats.peek_calls,
        receive_batches = stats.receive_batches.len(),
        batch_sends = stats.batch_sends.len(),
        clients_closed = stats.clients_closed,
        "Broker activity"
    );
    Ok(())
}

fn seed(args: &Args) -> Result<InMemoryBroker> {
    let broker = InMemoryBroker::new();
    broker.create_queue(&args.queue, args.sessions > 0);

    for i in 0..args.messages {
        let mut message = OutgoingMessage::new(format!("{{\"order\": {}, \"status\": \"placed\"}}", i + 1));
        message.content_type = Some("application/json".to_string());
        message.subject = Some(if i % 2 == 0 { "Order.Placed" } else { "Order.Updated" }.to_string());
        if args.sessions > 0 {
            message.session_id = Some(format!("customer-{}", i % args.sessions));
        }
        broker.enqueue(&args.queue, message)?;
    }

    let dead_lettered = (1..=args.dead_lettered as i64)
        .filter(|&seq| broker.dead_letter(&args.queue, seq, "ValidationFailed", Some("seeded by bl-dev")))
        .count();

    info!(
        queue = %args.queue,
        messages = args.messages,
        sessions = args.sessions,
        dead_lettered = dead_lettered,
        "Seeded in-memory broker"
    );
    Ok(broker)
}

async fn open(
    args: &Args,
    broker: &InMemoryBroker,
    config: &ExplorerConfig,
) -> Result<Arc<dyn BrokerOperations>> {
    let auth = if args.delegated {
        AuthMode::Delegated {
            namespace: NAMESPACE.to_string(),
            credential: Arc::new(NamedCredential::new("bl-dev")),
        }
    } else {
        AuthMode::SharedSecret {
            connection_string: format!(
                "Endpoint=sb://{}/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=dev",
                NAMESPACE
            ),
        }
    };

    let operations = connect(
        auth,
        Arc::new(broker.clone()),
        Arc::new(ConnectionPool::new()),
        config,
        Arc::new(TracingStatusSink),
    )
    .await
    .context("Failed to connect")?;

    info!(namespace = operations.namespace(), auth = operations.auth_kind().as_str(), "Connected");
    Ok(operations)
}

async fn run(args: &Args, operations: Arc<dyn BrokerOperations>, config: &ExplorerConfig) -> Result<()> {
    let queue = EntityPath::queue(args.queue.as_str());

    match &args.command {
        Command::Entities { json } => {
            if *json {
                let queues = operations.list_queues().await?;
                let topics = operations.list_topics().await?;
                let listing = serde_json::json!({ "queues": queues, "topics": topics });
                println!("{}", serde_json::to_string_pretty(&listing)?);
                return Ok(());
            }

            for q in operations.list_queues().await? {
                println!(
                    "queue {:<24} active={:<6} dead-letter={:<6} sessions={}",
                    q.name, q.active_message_count, q.dead_letter_message_count, q.requires_session
                );
            }
            for topic in operations.list_topics().await? {
                println!("topic {:<24} subscriptions={}", topic.name, topic.subscription_count);
                for sub in operations.list_subscriptions(&topic.name).await? {
                    println!(
                        "  sub {:<22} active={:<6} dead-letter={}",
                        sub.name, sub.active_message_count, sub.dead_letter_message_count
                    );
                }
            }
        }

        Command::Browse {
            pages,
            filter,
            descending,
            dead_letter,
        } => {
            let pager = PaginationController::new(operations, config.paging.clone(), Arc::new(TracingStatusSink));
            if let Some(filter) = filter {
                pager.set_filter(filter);
            }
            if *descending {
                pager.set_sort_order(SortOrder::Descending);
            }

            let context = BrowseContext::new(queue.with_dead_letter(*dead_letter), args.sessions > 0);
            pager.load_first_page(context).await?;
            print_page(&pager);

            for _ in 1..*pages {
                match pager.load_next_page().await? {
                    LoadOutcome::Loaded { .. } | LoadOutcome::Cached { .. } => print_page(&pager),
                    LoadOutcome::Exhausted => {
                        println!("No more messages");
                        break;
                    }
                    other => warn!(outcome = ?other, "Unexpected load outcome"),
                }
            }
        }

        Command::Purge { dead_letter } => {
            let path = queue.with_dead_letter(*dead_letter);
            let result = with_cancel(|cancel| async move { operations.purge_messages(&path, &cancel).await }).await?;
            report(&result);
        }

        Command::Delete { seq, dead_letter } => {
            let path = queue.with_dead_letter(*dead_letter);
            let result =
                with_cancel(|cancel| async move { operations.delete_messages(&path, seq, &cancel).await }).await?;
            report(&result);
        }

        Command::Resend { seq } => {
            let request = PeekRequest::new(queue.clone(), config.paging.max_total_messages)
                .requires_session(args.sessions > 0);
            let records: Vec<_> = operations
                .peek_messages(&request)
                .await?
                .into_iter()
                .filter(|r| seq.contains(&r.sequence_number))
                .collect();
            if records.is_empty() {
                bail!("None of the given sequence numbers are in {}", queue);
            }

            let entity = queue.send_target().to_string();
            let result = with_cancel(|cancel| async move {
                operations.resend_messages(&entity, &records, &cancel).await
            })
            .await?;
            report(&result);
        }

        Command::Resubmit { seq } => {
            let path = queue.clone().dead_letter();
            let result = with_cancel(|cancel| async move {
                operations.resubmit_dead_letter_messages(&path, seq, &cancel).await
            })
            .await?;
            report(&result);
        }
    }

    Ok(())
}

/// Run a bulk operation that Ctrl-C cancels between batches
async fn with_cancel<F, Fut>(operation: F) -> Result<BulkOperationResult>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = bl_common::Result<BulkOperationResult>>,
{
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling after the current batch");
                cancel.cancel();
            }
        })
    };

    let result = operation(cancel).await;
    watcher.abort();
    Ok(result?)
}

fn print_page(pager: &PaginationController) {
    let state = pager.pagination();
    println!("{}", state.text);
    for record in pager.filtered_view() {
        println!(
            "  #{:<6} {:<36} {:<14} {}",
            record.sequence_number,
            record.message_id,
            record.subject.as_deref().unwrap_or("-"),
            record.body_preview
        );
    }
}

fn report(result: &BulkOperationResult) {
    if result.is_complete_success() {
        info!(kind = result.kind.as_str(), completed = result.completed, "Bulk operation finished");
    } else {
        warn!(
            kind = result.kind.as_str(),
            completed = result.completed,
            requested = result.requested,
            "Bulk operation finished partially"
        );
    }
    println!("{}", result.summary());
}
