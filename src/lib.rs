//! Orchestration core of a file-transfer daemon.
//!
//! A [`bus::Bus`] carries [`protocol::Message`]s between a [`client::Client`]
//! and a [`daemon::Daemon`]. The daemon keeps every operation in an
//! [`registry::OperationRegistry`] and drives one [`runner::Runner`] per
//! operation, broadcasting status updates as the runner reports them.

pub mod bus;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod reporter;
pub mod runner;
