//! In-crate coordinator configuration.
//!
//! Distinct from the daemon's file/env configuration loader (out of scope):
//! the core accepts a `CoordinatorConfig` value and never parses config files
//! or environment variables itself.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorConfig {
    /// Worker pool bounds for the parallel copier and snapshot codec.
    /// Values outside `[min_workers, max_workers]` are clamped, never rejected.
    pub min_workers: usize,
    pub max_workers: usize,
    /// Default worker count used when a caller does not specify one.
    pub default_workers: usize,
    /// Rows per `COPY` chunk; bounds how often cancellation is observed.
    pub copy_chunk_rows: usize,
    /// How often the init manager polls subscription catch-up LSN.
    pub catchup_poll_interval: Duration,
    /// How often a progress stream emits an update in the absence of a
    /// state change.
    pub progress_poll_interval: Duration,
    pub naming: NamingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            default_workers: 4,
            copy_chunk_rows: 1_000,
            catchup_poll_interval: Duration::from_millis(500),
            progress_poll_interval: Duration::from_millis(500),
            naming: NamingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Clamp a requested worker count into `[min_workers, max_workers]`.
    /// Zero or negative values clamp to `min_workers`.
    pub fn clamp_workers(&self, requested: i64) -> usize {
        if requested <= 0 {
            self.min_workers
        } else {
            (requested as usize).clamp(self.min_workers, self.max_workers)
        }
    }
}

/// Object-naming conventions for coordinator-owned replication objects.
/// These match the extension's bookkeeping and must stay in sync with it.
#[derive(Clone, Debug, PartialEq)]
pub struct NamingConfig {
    pub init_slot_prefix: String,
    pub snapshot_slot_prefix: String,
    pub publication_prefix: String,
    pub subscription_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            init_slot_prefix: "steep_init_".to_string(),
            snapshot_slot_prefix: "steep_".to_string(),
            publication_prefix: "steep_pub_".to_string(),
            subscription_prefix: "steep_sub_".to_string(),
        }
    }
}

impl NamingConfig {
    pub fn init_slot_name(&self, source_node_id: &str) -> String {
        format!("{}{}", self.init_slot_prefix, source_node_id)
    }

    pub fn snapshot_slot_name(&self, snapshot_id: &str) -> String {
        format!("{}{}", self.snapshot_slot_prefix, snapshot_id)
    }

    pub fn publication_name(&self, source_node_id: &str) -> String {
        format!("{}{}", self.publication_prefix, source_node_id)
    }

    pub fn subscription_name(&self, target_node_id: &str, source_node_id: &str) -> String {
        format!(
            "{}{}_from_{}",
            self.subscription_prefix, target_node_id, source_node_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_zero_and_negative_to_minimum() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.clamp_workers(0), 1);
        assert_eq!(cfg.clamp_workers(-5), 1);
    }

    #[test]
    fn clamps_excess_to_maximum() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.clamp_workers(100), 16);
    }

    #[test]
    fn passes_through_in_range_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.clamp_workers(4), 4);
    }

    #[test]
    fn naming_conventions_match_spec() {
        let naming = NamingConfig::default();
        assert_eq!(naming.init_slot_name("node_a"), "steep_init_node_a");
        assert_eq!(naming.publication_name("node_a"), "steep_pub_node_a");
        assert_eq!(
            naming.subscription_name("node_b", "node_a"),
            "steep_sub_node_b_from_node_a"
        );
    }
}
