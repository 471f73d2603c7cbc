//! GPS tracker ingest daemon: listeners, per-connection sessions, track store and the
//! in-memory device registry.

pub mod config;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;
