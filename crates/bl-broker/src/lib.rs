//! BusLens broker layer
//!
//! - [`sdk`]: the transport traits the rest of the workspace programs against
//! - [`memory`]: an in-memory namespace implementing those traits

pub mod memory;
pub mod sdk;

pub use memory::{BrokerStats, InMemoryBroker};
pub use sdk::{
    AdminClient, BrokerClient, BrokerConnector, BrokerMessage, BrokerResult, MessageReceiver,
    MessageSender, NamedCredential, OutgoingMessage, ReceiveMode, SessionPeeker, TokenCredential,
};
