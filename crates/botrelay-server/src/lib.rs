//! # botrelay-server
//!
//! Axum HTTP + `WebSocket` front end for the broker.
//!
//! - Upgrade endpoints for Adapters (plus the `/onebot` alias) and Processors
//! - `X-Self-ID` / `X-Platform` identity hints
//! - `/health` snapshot and Prometheus `/metrics`
//! - Bounded shutdown that reports undelivered work

#![deny(unsafe_code)]

pub mod health;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sink;

pub use server::{AppState, RelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
