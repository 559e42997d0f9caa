//! # botrelay-core
//!
//! Foundation types, errors, branded IDs, and utilities for the bot relay.
//!
//! This crate provides the shared vocabulary that all other relay crates depend on:
//!
//! - **Branded IDs**: `AdapterId`, `ProcessorId`, `RequestToken` as newtypes for type safety
//! - **Events**: [`Event`], the typed OneBot-style payload with an opaque passthrough bag
//! - **Reply vocabulary**: synthesized failure replies with stable retcodes
//! - **Errors**: `RelayError` hierarchy via `thiserror`
//! - **Retry**: [`RetryPolicy`] for bounded delivery retries
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod event;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod status;

pub use errors::{LinkError, RelayError, Result};
pub use event::Event;
pub use ids::{AdapterId, ProcessorId, RequestToken};
pub use retry::RetryPolicy;
pub use status::FailureKind;
