//! Resource-usage oracle
//!
//! The engine decides which attached devices are orphaned by asking an
//! oracle which device keys live workloads currently hold. In a cluster
//! deployment the oracle wraps the node's pod-resources endpoint; tests and
//! standalone runs use [`FixedUsage`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use crate::catalog::DeviceKey;

/// Read-only view of device usage.
pub trait UsageOracle: Send + Sync {
    /// Device keys currently held by running workloads, each mapped to a
    /// human-readable witness (e.g. the workload's name) for logging.
    fn held_devices(
        &self,
    ) -> impl Future<Output = anyhow::Result<HashMap<DeviceKey, String>>> + Send;
}

/// Oracle over an externally maintained usage set.
#[derive(Default)]
pub struct FixedUsage {
    held: Mutex<HashMap<DeviceKey, String>>,
}

impl FixedUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, key: DeviceKey, witness: impl Into<String>) {
        if let Ok(mut held) = self.held.lock() {
            held.insert(key, witness.into());
        }
    }

    pub fn release(&self, key: &DeviceKey) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(key);
        }
    }
}

impl UsageOracle for FixedUsage {
    async fn held_devices(&self) -> anyhow::Result<HashMap<DeviceKey, String>> {
        match self.held.lock() {
            Ok(held) => Ok(held.clone()),
            Err(_) => anyhow::bail!("usage set poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_usage_reports_held_keys() {
        let oracle = FixedUsage::new();
        let key = DeviceKey::from_raw("cameras_abc123");
        oracle.hold(key.clone(), "pod/studio-feed");

        let held = oracle.held_devices().await.unwrap();
        assert_eq!(held.get(&key).map(String::as_str), Some("pod/studio-feed"));

        oracle.release(&key);
        assert!(oracle.held_devices().await.unwrap().is_empty());
    }
}
