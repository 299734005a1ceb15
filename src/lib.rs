//! Welfare portal chat sync
//!
//! Turns the loosely shaped message rows returned by the portal's n8n webhooks
//! into per-member conversations, and keeps them current by polling and merging
//! without duplicates.

pub mod message;
pub mod normalize;
pub mod conversation;
pub mod merge;
pub mod client;
pub mod session;
pub mod sync;
pub mod config;
pub mod error;

pub use error::{Error, Result};
