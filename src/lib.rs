//! Floodgate - Request Throttling Engine
//!
//! This crate limits how many requests a caller may make within a time
//! window. Counter state lives in a shared remote store (Redis) so every
//! instance enforces the same quota, with an in-process fallback that keeps
//! throttling running when the remote is unreachable.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{FloodgateError, Result, StoreError};
