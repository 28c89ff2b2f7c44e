//! Offline-resilient client for the test-prep admin backend.
//!
//! Mutations made while offline are queued and replayed in order once the
//! backend is reachable again; reads fall back to a cache with expiry.

pub mod api;
pub mod config;
pub mod logging;
pub mod offline;
