//! Foundation module - Core utilities and types
//!
//! - Generation-indexed handles and slot pools
//! - Logging utilities

pub mod collections;
pub mod logging;

pub use collections::{Handle, Pool};
