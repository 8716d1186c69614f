//! Settlement server — receives payment-processor webhooks and delivers
//! sale tokens on-chain from a custodial wallet.
//!
//! The pipeline (signature verification, idempotency, inventory, dispatch,
//! reconciliation) lives in the core [`tokengate`] crate; this crate provides
//! the HTTP server, state management and operational surface.
//!
//! # Modules
//!
//! - [`routes`] — HTTP endpoints (webhook, payment lookup, health, metrics)
//! - [`state`] — Shared [`AppState`](state::AppState)
//! - [`bootstrap`] — Typed startup configuration to a ready `AppState`
//! - [`metrics`] — Prometheus metrics for webhook and settlement activity

pub mod bootstrap;
pub mod metrics;
pub mod routes;
pub mod state;
