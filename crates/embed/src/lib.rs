//! Embedding providers for driftguard.
//!
//! [`provider::Embedder`] is the contract; everything else is an
//! implementation or a wrapper around one.

pub mod cache;
pub mod hashed;
pub mod http;
pub mod provider;

pub use provider::{EmbedError, Embedder};
