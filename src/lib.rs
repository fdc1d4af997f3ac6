//! optrack - progress tracking for long-running, multi-step backend operations.
//!
//! A `ProgressCoordinator` merges locally-predicted step transitions with the
//! authoritative updates a server pushes over a realtime socket, and exposes
//! one read model the UI can render on every frame.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod steps;
pub mod types;

pub use config::Config;
pub use coordinator::{ProgressCoordinator, ProgressView, SessionPhase};
pub use types::{new_operation_id, ProgressUpdate, Step, StepDefinition, StepPatch, StepStatus};
