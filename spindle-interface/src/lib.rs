//! The end-user entry point: `createReservation` over HTTP.
//!
//! A recurring reservation gets a fresh UUID, a synchronous first fire
//! through the shared invoker, and a notification to the scheduler's
//! live-add endpoint so it joins the heap. One-shot functions are invoked
//! inline and their value returned directly.

pub mod http;
pub mod server;

pub use server::InterfaceServer;
