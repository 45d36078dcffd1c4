//! The scheduler: a min-heap of every live reservation ordered by
//! next-fire time, seeded from the catalog at startup, fed live additions
//! over HTTP, and drained into the broker in bounded, backpressured ticks.

pub mod heap;
pub mod http;
pub mod server;

pub use heap::{HeapEntry, ReservationHeap};
pub use server::SchedulerServer;
