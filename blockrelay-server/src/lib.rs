//! The relay server component.
//!
//! This builds on top of the [`blockrelay_service`] crate and exposes stored objects as
//! range-addressable HTTP downloads that browsers and media players can seek in.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod healthcheck;
pub mod observability;
pub mod state;
pub mod web;
