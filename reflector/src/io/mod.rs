//! I/O helpers for reflector commands.

pub mod atomic;
pub mod command_registry;
pub mod config;
pub mod init;
pub mod loop_state;
pub mod process;
pub mod processed;
pub mod prompt;
pub mod registry;
pub mod spec_store;
pub mod staging;
pub mod transform;
