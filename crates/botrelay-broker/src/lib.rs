//! # botrelay-broker
//!
//! The relay's in-memory core, independent of any transport:
//!
//! - **Registry**: live Adapters keyed by identity, Processors in connect order
//! - **Correlation**: broker-minted request tokens and their waiters
//! - **Routing**: exact and wildcard rules from subjects to Processors
//! - **Balancing**: tiered Processor selection when no rule applies
//! - **Caching**: bounded FIFO of events no Processor could take
//! - **Broker**: the façade tying them together, plus read loops that drive
//!   a connection from a stream of [`link::Inbound`] frames

#![deny(unsafe_code)]

pub mod balancer;
pub mod broker;
pub mod cache;
pub mod connection;
pub mod contacts;
pub mod correlation;
pub mod driver;
pub mod heartbeat;
pub mod link;
pub mod metrics;
pub mod registry;
pub mod routing;

pub use broker::{AdapterHints, Broker, BrokerConfig, BrokerSnapshot, Delivery};
pub use connection::{AdapterConnection, HealthPolicy, ProcessorConnection};
pub use driver::{EndReason, drive_adapter, drive_processor};
pub use link::{ChannelSink, FrameSink, Inbound, Outbound};
pub use routing::RoutingRules;
