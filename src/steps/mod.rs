//! Step state for the active operation

pub mod store;

pub use store::{StepStateStore, TerminalOverwrite};
