//! The Argus agent server.
//!
//! Wires the store, bus, engines, tools, providers, and agent layer into
//! one axum application serving telemetry ingest, the REST catalog, and
//! the realtime WebSocket push session.

mod app;
mod http;
mod ingest;
mod state;
mod ws;

pub use app::{build, router, run};
pub use state::AppState;
