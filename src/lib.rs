// ABOUTME: Library root for halyard - exposes the deployment controller and its adapters.
// ABOUTME: The main binary is in main.rs.

pub mod backoff;
pub mod build;
pub mod config;
pub mod deploy;
pub mod diagnostics;
pub mod error;
pub(crate) mod fs_atomic;
pub mod hooks;
pub mod infra;
pub mod orchestration;
pub mod output;
pub mod probe;
pub mod process;
pub mod registry;
pub mod store;
pub mod types;
