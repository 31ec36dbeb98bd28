//! Signaling relay: registers clients under stable ids and display names,
//! routes offer/answer/candidate frames between them, buffers frames for
//! offline receivers and evicts clients that stop answering pings.

pub mod app;
pub mod config;
pub mod error;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod ws;

pub use app::{build_router, serve};
pub use config::RelayConfig;
