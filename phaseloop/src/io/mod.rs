//! Side-effecting adapters: filesystem, child processes, HTTP.

pub mod atomic;
pub mod config;
pub mod file_tracker;
pub mod generation;
pub mod init;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod status_sink;
pub mod test_runner;
