//! Core types shared across the cadence scheduler daemon.
//!
//! This crate provides the canonical time representation used
//! throughout the daemon, registry loader, and CLI front-end. Each
//! crate defines its own domain-specific error enums rather than
//! sharing a common error type.

pub mod time;

pub use time::Moment;
