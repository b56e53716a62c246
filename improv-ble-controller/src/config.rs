//! Provisioning timeouts, loaded from `$IMPROV_HOME/config.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory, set IMPROV_HOME")]
    NoHome,
    #[error("failed to read config {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("invalid config {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Bound on each GATT round trip: connection setup, negotiation, command writes
    #[serde(with = "seconds")]
    pub io_timeout: Duration,
    /// How long to wait for the device to finish identifying. Best effort.
    #[serde(with = "seconds")]
    pub identify_timeout: Duration,
    /// How long the user has to confirm on the device
    #[serde(with = "seconds")]
    pub authorization_timeout: Duration,
    /// Wait for a terminal state after sending credentials
    #[serde(with = "seconds")]
    pub provisioning_timeout: Duration,
    /// How many `Provisioning` notifications may restart `provisioning_timeout`
    pub provisioning_refreshes: u8,
    /// Wait for the RPC result (redirect URL) once the device reports `Provisioned`
    #[serde(with = "seconds")]
    pub result_grace: Duration,
    #[serde(with = "seconds")]
    pub scan_duration: Duration,
    /// Addresses this controller already manages
    pub known_devices: Vec<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(10),
            authorization_timeout: Duration::from_secs(60),
            provisioning_timeout: Duration::from_secs(15),
            provisioning_refreshes: 1,
            result_grace: Duration::from_secs(1),
            scan_duration: Duration::from_secs(5),
            known_devices: Vec::new(),
        }
    }
}

impl ProvisionConfig {
    /// Load config from file, defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Longest a provisioning attempt can wait after the credentials are sent
    pub fn max_provisioning_wait(&self) -> Duration {
        self.provisioning_timeout
            .saturating_mul(u32::from(self.provisioning_refreshes) + 1)
    }
}

/// `$IMPROV_HOME`, or `~/.improv`
pub fn improv_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("IMPROV_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".improv"))
        .ok_or(ConfigError::NoHome)
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
