// ── Sync engine configuration ──
//
// Runtime knobs for the coordinator and dispatcher. Link settings live on
// `ControllerLinkConfig` / `CloudLinkConfig`; file and env loading is
// hublink-config's job.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Run the recovery pass when the cloud link comes back.
    pub auto_restore: bool,
    /// Ack timeout for `agent:sync`.
    pub submit_timeout: Duration,
    /// Ack timeout for `agent:devices` during recovery.
    pub restore_timeout: Duration,
    /// Upper bound on one controller service call.
    pub command_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_restore: true,
            submit_timeout: Duration::from_secs(30),
            restore_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(10),
        }
    }
}
