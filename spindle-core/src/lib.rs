//! Core types shared by every Spindle crate: configuration, the unified
//! error type, and reservation identity.

pub mod config;
pub mod error;
pub mod reservation;

pub use config::SpindleConfig;
pub use error::SpindleError;
pub use reservation::{Job, ReservationId};
