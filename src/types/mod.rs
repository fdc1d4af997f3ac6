//! Data model for tracked operations: steps and the socket wire messages.

pub mod step;
pub mod wire;

pub use step::{Step, StepDefinition, StepPatch, StepStatus};
pub use wire::{ControlMessage, ProgressUpdate};

use chrono::Utc;
use uuid::Uuid;

/// Generate a unique operation id of the form `<prefix>-<unix millis>-<8 hex>`.
///
/// Callers create the id before starting an operation so the same value can be
/// sent with the originating request and used to filter socket updates.
pub fn new_operation_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_format() {
        let id = new_operation_id("remove-config");
        assert!(id.starts_with("remove-config-"));

        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_operation_ids_are_unique() {
        assert_ne!(new_operation_id("op"), new_operation_id("op"));
    }
}
