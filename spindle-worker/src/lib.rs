//! The worker: consumes reservation UUIDs from the broker, resolves each
//! into a job (account data + plugin arguments), executes the plugin under
//! a concurrency cap, and persists the result. Delivery is at-most-once:
//! messages are acknowledged before dispatch.

pub mod account_cache;
pub mod http;
pub mod server;

pub use account_cache::AccountCache;
pub use server::{WorkerServer, WorkerStatus};
