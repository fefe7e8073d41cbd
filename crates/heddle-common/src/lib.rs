//! Shared plumbing for the Heddle AT Protocol OAuth client.
//!
//! This crate carries the pieces every layer needs: a minimal [`HttpClient`]
//! abstraction (with a `reqwest` implementation), the pluggable
//! [`storage::Storage`] capability with TTL semantics, and validated
//! identifier newtypes ([`types::Did`], [`types::Handle`]).

pub mod http_client;
pub mod storage;
pub mod types;

pub use http_client::HttpClient;
pub use storage::{MemoryStore, Storage, StorageError};
pub use types::{AtStrError, Did, Handle};
