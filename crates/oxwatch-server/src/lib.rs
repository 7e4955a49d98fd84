//! The oxwatch server: configuration snapshots, the running engine and its
//! HTTP export API.

pub mod api;
pub mod app;
pub mod config;
pub mod engine;
pub mod logging;
pub mod metrics;
pub mod snapshot;
pub mod source;
pub mod state;
