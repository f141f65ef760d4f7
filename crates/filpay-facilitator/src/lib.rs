//! HTTP edge for the filpay facilitator.
//!
//! Routes, configuration, metrics, and the shared application state live
//! here; all payment semantics live in the `filpay` core crate. `main.rs`
//! wires the two together and spawns the background workers.

pub mod config;
pub mod headers;
pub mod metrics;
pub mod routes;
pub mod state;
