//! The relay's HTTP front end.
//!
//! [`App`] wires routing and middleware into a tower service. [`server()`] binds the configured
//! address and serves the application until a termination signal arrives.
//!
//! End-to-end tests start the application through the `blockrelay-test` crate.

mod app;
mod middleware;
mod server;

pub use app::App;
pub use server::server;
