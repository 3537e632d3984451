//! Core crate for the provider callback pipeline.

pub mod callback;
pub mod config;
pub mod correlator;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod secrets;
pub mod server;
pub mod signature;
pub mod store;
