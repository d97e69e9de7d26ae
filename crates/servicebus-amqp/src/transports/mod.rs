//! Transport implementations.
//!
//! Production deployments plug an AMQP 1.0 client in behind the traits in
//! [`crate::transport`]. The in-memory broker here backs tests and local
//! development.

pub mod memory;

pub use memory::{
    status_reply, InMemoryBroker, InMemoryConnection, Responder, Settlement, SettlementOutcome,
};
