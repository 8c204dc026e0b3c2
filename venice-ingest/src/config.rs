//! The configuration surface enumerated in §6, mirroring `LifecycleConfig`'s
//! style of a plain struct with documented defaults.

use std::time::Duration;

/// Per-store-version configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Mini-batch width for the parallel batch processor (§4.D). Default 8.
    pub parallel_processing_pool_size: usize,
    /// How long `wait_until_schema_available`/`wait_version_state_available`
    /// may block before failing (§5).
    pub schema_polling_timeout: Duration,
    /// Fixed interval between schema/version-state polls (§5).
    pub schema_polling_delay: Duration,
    /// Selects which DIV tracker topology is used (§3).
    pub global_rt_div_enabled: bool,
    /// Enables the active/active merge path (§4.E, §4.F).
    pub active_active_replication_enabled: bool,
    /// Enables chunked-value handling in the pre-flight schema check (§4.E).
    pub chunking_enabled: bool,
    /// Enables `START_OF_INCREMENTAL_PUSH`/`END_OF_INCREMENTAL_PUSH`
    /// handling (§4.E).
    pub incremental_push_enabled: bool,
    /// Whether real-time writes use a separate RT topic from the VT.
    pub separate_rt_topic_enabled: bool,
    /// Interval on which `LeaderCompleteState` is recomputed for heartbeats
    /// (§4.I).
    pub leader_complete_state_check_interval: Duration,
    /// Whether this partition is being consumed for data recovery (§4.E
    /// `TOPIC_SWITCH` handling).
    pub is_data_recovery: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            parallel_processing_pool_size: 8,
            schema_polling_timeout: Duration::from_secs(60),
            schema_polling_delay: Duration::from_millis(100),
            global_rt_div_enabled: false,
            active_active_replication_enabled: false,
            chunking_enabled: false,
            incremental_push_enabled: false,
            separate_rt_topic_enabled: false,
            leader_complete_state_check_interval: Duration::from_secs(1),
            is_data_recovery: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = IngestionConfig::default();
        assert_eq!(config.parallel_processing_pool_size, 8);
        assert!(!config.active_active_replication_enabled);
    }
}
