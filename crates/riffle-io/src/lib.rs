//! # Riffle I/O - Process and Text Plumbing
//!
//! User logic in a riffle flow is a child process: a shell command that
//! reads rows (or raw bytes) on stdin and writes them back on stdout.
//! This crate owns that contract, plus the driver-side text sources that
//! feed flows from files, sockets, and arbitrary readers.

pub mod command;
pub mod text;

pub use command::{run_command, run_command_per_row};
