//! Test utilities for the block relay.
//!
//! This crate provides utilities to run the relay in-process against fixture objects. See the
//! modules for all available utilities.

pub mod server;
pub mod tracing;
