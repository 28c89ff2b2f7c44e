//! Client for the test-prep admin backend.
//!
//! Requests go through `ApiClient`, which hands mutations to the offline queue
//! and falls back to cached reads whenever connectivity is down.

mod auth;
mod client;
mod http;
mod resources;

pub use auth::SessionTokens;
pub use client::{cache_key, decode, ApiClient, ApiResponse};
pub use http::HttpTransport;
pub use resources::{Category, Resource, ResourceKind};
