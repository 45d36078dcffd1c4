//! Outbound HTTP for the Spindle platform.
//!
//! `RequestQueuer` is the per-host rate-limited, concurrency-capped client
//! every outbound request funnels through. `PageGetter` layers a
//! conditional HTTP cache over it, persisted in the blob store, with
//! SHA-1-based change detection and stale-content suppression.

pub mod client;
pub mod pagegetter;
pub mod queuer;

pub use client::{HttpTransport, PageRequest, PageResponse, Transport};
pub use pagegetter::{CacheMode, FetchedPage, GetOptions, PageGetter};
pub use queuer::RequestQueuer;

use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced by the request queuer and page getter.
///
/// `StaleContent` is flow control, not a failure: it tells the caller the
/// resource still hashes to the SHA-1 it already holds.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        headers: HashMap<String, String>,
    },

    #[error("stale content: {0}")]
    StaleContent(String),

    #[error("cache store error: {0}")]
    Store(#[from] spindle_store::StoreError),
}

impl FetchError {
    /// True for the stale-content control-flow variant.
    pub fn is_stale(&self) -> bool {
        matches!(self, FetchError::StaleContent(_))
    }
}
