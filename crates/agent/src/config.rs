//! Agent configuration
//!
//! A single TOML file: one `[agent]` table of runtime settings plus a
//! `resources` map from resource name to the device specs advertised under
//! that name.
//!
//! ```toml
//! [agent]
//! log_level = "info"
//! check_interval_secs = 10
//!
//! [[resources.cameras]]
//! target = { host = "10.0.0.5", port = 3240 }
//! match = { vendor = "0fd9", product = "0063" }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::DeviceSpec;
use crate::reconciler::ManagerSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    /// Resource name to the devices advertised under it. A BTreeMap keeps
    /// registration order deterministic.
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<DeviceSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentSettings {
    pub log_level: String,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub check_interval_secs: u64,
    pub attach_wait_attempts: u32,
    pub attach_wait_step_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            check_interval_secs: 10,
            attach_wait_attempts: 5,
            attach_wait_step_secs: 3,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// `usbip-agent/config.toml` under the platform config directory, with
    /// an `/etc` fallback for systems without one.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("usbip-agent/config.toml"))
            .unwrap_or_else(|| PathBuf::from("/etc/usbip-agent/config.toml"))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.agent.check_interval_secs)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            attach_wait_attempts: self.agent.attach_wait_attempts,
            attach_wait_step: Duration::from_secs(self.agent.attach_wait_step_secs),
        }
    }
}
