//! Process management

pub mod creation;
pub mod manager;
pub mod process;

pub use manager::ProcessTable;
pub use process::{Process, ProcessId, ProcessState};
