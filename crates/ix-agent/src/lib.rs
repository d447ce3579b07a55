//! ix relay agent library crate.
//!
//! Re-exports all modules so external crates (e.g. `ix-e2e-tests`) can
//! drive the `ConnectionManager`, `Dispatcher` and credential providers.

pub mod cli;
pub mod command;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
