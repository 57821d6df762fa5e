//! # Request Handlers
//!
//! Organized by functional area.

pub mod health;
pub mod syndication;
pub mod tagging;
