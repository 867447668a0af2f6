// Boot-time configuration. Delivered serialized inside `read-config-req`;
// every pool is sized once from these values and never grows.

use serde::{Deserialize, Serialize};
use undertow_base::Result;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TcConfig {
    /// Client-facing connection records. The same count again is reserved
    /// for commit-copy records and for take-over records.
    pub api_connections: u32,
    /// Operation records across all live transactions.
    pub tc_ops: u32,
    /// Table catalog slots.
    pub tables: u32,
    /// Concurrent scans.
    pub scan_records: u32,
    /// Fragment-scan processes across all scans.
    pub scan_frag_records: u32,
    /// Global-checkpoint records.
    pub gcp_records: u32,
    /// Shared key/attrinfo buffer memory in bytes.
    pub transaction_buffer_bytes: u32,
    pub max_indexes: u32,
    pub max_index_operations: u32,
    pub max_triggers: u32,
    pub max_fired_triggers: u32,
    /// Transaction deadlock detection timeout, milliseconds.
    pub deadlock_timeout_ms: u32,
    /// Timeout for an open transaction with nothing outstanding,
    /// milliseconds. 0 disables the check.
    pub inactive_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    /// Watchdog period in 10 ms ticks.
    pub timeout_check_ticks: u32,
    /// Take-over transactions driven concurrently per failed node.
    pub no_parallel_takeover: u32,
}

impl Default for TcConfig {
    fn default() -> Self {
        TcConfig {
            api_connections: 20,
            tc_ops: 200,
            tables: 16,
            scan_records: 100,
            scan_frag_records: 400,
            gcp_records: 10,
            transaction_buffer_bytes: 1024 * 1024,
            max_indexes: 128,
            max_index_operations: 8192,
            max_triggers: 768,
            max_fired_triggers: 4000,
            deadlock_timeout_ms: 1200,
            inactive_timeout_ms: 0,
            heartbeat_interval_ms: 1500,
            timeout_check_ticks: 50,
            no_parallel_takeover: 4,
        }
    }
}

impl TcConfig {
    pub fn from_json(doc: &str) -> Result<TcConfig> {
        let mut cfg: TcConfig = serde_json::from_str(doc)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamp values the rest of the block assumes are sane. The deadlock
    /// timeout has a protocol floor; a zero inactive timeout means the check
    /// is off, so it passes through unchanged.
    pub fn normalize(&mut self) {
        self.deadlock_timeout_ms = self.deadlock_timeout_ms.max(50);
        self.no_parallel_takeover = self.no_parallel_takeover.clamp(1, 16);
        self.timeout_check_ticks = self.timeout_check_ticks.max(1);
        self.api_connections = self.api_connections.max(1);
        self.tc_ops = self.tc_ops.max(1);
    }

    /// Deadlock timeout in watchdog clock ticks.
    pub fn deadlock_ticks(&self) -> u32 {
        self.deadlock_timeout_ms / 10
    }

    pub fn inactive_ticks(&self) -> Option<u32> {
        if self.inactive_timeout_ms == 0 {
            None
        } else {
            Some(self.inactive_timeout_ms / 10)
        }
    }
}

#[cfg(test)]
mod cfgtest {
    use super::TcConfig;
    use test_log::test;

    #[test]
    fn test_defaults_normalize_clean() {
        let mut cfg = TcConfig::default();
        let before = cfg.clone();
        cfg.normalize();
        assert_eq!(cfg, before);
    }

    #[test]
    fn test_from_json_overrides_and_clamps() {
        let cfg = TcConfig::from_json(
            r#"{"api_connections": 4, "deadlock_timeout_ms": 10, "no_parallel_takeover": 99}"#,
        )
        .unwrap();
        assert_eq!(cfg.api_connections, 4);
        assert_eq!(cfg.deadlock_timeout_ms, 50);
        assert_eq!(cfg.no_parallel_takeover, 16);
        assert_eq!(cfg.tables, 16);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(TcConfig::from_json(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn test_inactive_zero_means_disabled() {
        let cfg = TcConfig::from_json(r#"{"inactive_timeout_ms": 0}"#).unwrap();
        assert_eq!(cfg.inactive_ticks(), None);
    }
}
