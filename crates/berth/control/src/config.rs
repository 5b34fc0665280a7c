//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing of the provisioning state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Upper bound on a single runtime create call.
    pub create_timeout_secs: u64,

    /// How long a reservation waits for its confirmation.
    pub reservation_ttl_secs: u64,

    /// After this long a claim on a confirmation is considered abandoned.
    pub claim_lease_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: 60,
            reservation_ttl_secs: 30 * 60,
            claim_lease_secs: 5 * 60,
        }
    }
}

impl ProvisioningConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs as i64)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }
}

/// Reconciliation sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Records inspected in parallel during a sweep.
    pub concurrency: usize,

    /// Also remove managed containers no record or open allocation accounts for.
    pub remove_orphans: bool,

    /// Name prefix of managed containers, used by the orphan sweep.
    pub name_prefix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            remove_orphans: false,
            name_prefix: "srv_".to_string(),
        }
    }
}
