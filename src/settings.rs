//! # Radio Settings
//!
//! Telemetry radio parameters and the store that reads and writes them.
//!
//! The session layer treats settings as an opaque payload: it loads, saves,
//! resets and copies them without validating individual values. What the radio
//! accepts is up to the radio.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// Parameters of the ground-side radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRadio {
    /// Serial baud rate between the radio and this computer
    pub baud_rate: u32,
    /// Over-the-air data rate in kbps
    pub air_speed: u32,
    pub network_id: u32,
    /// Transmit power in dBm
    pub tx_power: u32,
    pub ecc: bool,
    /// MAVLink framing version
    pub mavlink: u8,
    pub op_resend: bool,
}

/// Parameters of the vehicle-side radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRadio {
    pub air_speed: u32,
    pub network_id: u32,
    pub tx_power: u32,
    pub ecc: bool,
    pub mavlink: u8,
    pub op_resend: bool,
}

/// Requested stream rates in Hz (0 disables a stream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStreamRates {
    pub heartbeat_rate: f64,
    pub extended_status_rate: u32,
    pub position_rate: u32,
    pub rc_channels_rate: u32,
    pub raw_sensor_rate: u32,
}

/// Full radio configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RadioSettings {
    pub local: LocalRadio,
    pub remote: RemoteRadio,
    pub data_stream: DataStreamRates,
}

impl Default for LocalRadio {
    fn default() -> Self {
        Self {
            baud_rate: 57600,
            air_speed: 64,
            network_id: 25,
            tx_power: 20,
            ecc: true,
            mavlink: 2,
            op_resend: false,
        }
    }
}

impl Default for RemoteRadio {
    fn default() -> Self {
        RemoteRadio::from(&LocalRadio::default())
    }
}

impl Default for DataStreamRates {
    fn default() -> Self {
        Self {
            heartbeat_rate: 1.0,
            extended_status_rate: 2,
            position_rate: 3,
            rc_channels_rate: 5,
            raw_sensor_rate: 0,
        }
    }
}

/// The air-side copy of the local parameters (the serial baud rate stays local)
impl From<&LocalRadio> for RemoteRadio {
    fn from(local: &LocalRadio) -> Self {
        Self {
            air_speed: local.air_speed,
            network_id: local.network_id,
            tx_power: local.tx_power,
            ecc: local.ecc,
            mavlink: local.mavlink,
            op_resend: local.op_resend,
        }
    }
}

impl RadioSettings {
    /// Decode settings from camelCase JSON
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode settings as pretty-printed camelCase JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Storage for radio settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read the current settings
    async fn load(&self) -> Result<RadioSettings>;

    /// Write settings to the radios
    async fn save(&self, settings: RadioSettings) -> Result<()>;

    /// Restore factory defaults and return them
    async fn reset_defaults(&self) -> Result<RadioSettings>;

    /// Apply the local radio parameters to the remote radio
    async fn copy_to_remote(&self, local: LocalRadio) -> Result<()>;

    /// Import settings from a JSON file
    async fn load_file(&self, path: &Path) -> Result<RadioSettings>;

    /// Export settings to a JSON file
    async fn save_file(&self, path: &Path, settings: &RadioSettings) -> Result<()>;
}

/// Settings held in memory, used when no radio is attached
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<RadioSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: RadioSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<RadioSettings> {
        Ok(self.settings.lock().await.clone())
    }

    async fn save(&self, settings: RadioSettings) -> Result<()> {
        debug!("Storing radio settings: {:?}", settings);
        *self.settings.lock().await = settings;
        Ok(())
    }

    async fn reset_defaults(&self) -> Result<RadioSettings> {
        let defaults = RadioSettings::default();
        *self.settings.lock().await = defaults.clone();
        info!("Radio settings reset to defaults");
        Ok(defaults)
    }

    async fn copy_to_remote(&self, local: LocalRadio) -> Result<()> {
        let mut settings = self.settings.lock().await;
        settings.remote = RemoteRadio::from(&local);
        settings.local = local;
        info!("Local radio settings copied to remote");
        Ok(())
    }

    async fn load_file(&self, path: &Path) -> Result<RadioSettings> {
        let contents = fs::read_to_string(path).await?;
        let settings = RadioSettings::from_json(&contents)?;
        *self.settings.lock().await = settings.clone();
        info!("Radio settings loaded from {}", path.display());
        Ok(settings)
    }

    async fn save_file(&self, path: &Path, settings: &RadioSettings) -> Result<()> {
        fs::write(path, settings.to_json()?).await?;
        info!("Radio settings saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GcsError;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = RadioSettings::default();
        assert_eq!(settings.local.baud_rate, 57600);
        assert_eq!(settings.local.air_speed, 64);
        assert_eq!(settings.local.network_id, 25);
        assert_eq!(settings.local.tx_power, 20);
        assert!(settings.local.ecc);
        assert_eq!(settings.local.mavlink, 2);
        assert!(!settings.local.op_resend);
        assert_eq!(settings.remote, RemoteRadio::from(&settings.local));
        assert_eq!(settings.data_stream.heartbeat_rate, 1.0);
        assert_eq!(settings.data_stream.rc_channels_rate, 5);
        assert_eq!(settings.data_stream.raw_sensor_rate, 0);
    }

    #[test]
    fn test_json_field_names() {
        let json = RadioSettings::default().to_json().unwrap();
        assert!(json.contains("\"dataStream\""));
        assert!(json.contains("\"networkId\""));
        assert!(json.contains("\"extendedStatusRate\""));
        assert!(!json.contains("network_id"));
    }

    #[test]
    fn test_from_json_rejects_incomplete_payload() {
        let result = RadioSettings::from_json(r#"{"local": {}}"#);
        assert!(matches!(result, Err(GcsError::Json(_))));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemorySettingsStore::default();
        let mut settings = store.load().await.unwrap();
        settings.local.network_id = 42;

        store.save(settings.clone()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_copy_to_remote_keeps_data_stream() {
        let store = MemorySettingsStore::default();
        let mut local = LocalRadio::default();
        local.air_speed = 128;
        local.tx_power = 30;
        local.baud_rate = 115200;

        store.copy_to_remote(local.clone()).await.unwrap();

        let settings = store.load().await.unwrap();
        assert_eq!(settings.remote.air_speed, 128);
        assert_eq!(settings.remote.tx_power, 30);
        assert_eq!(settings.local, local);
        assert_eq!(settings.data_stream, DataStreamRates::default());
    }

    #[tokio::test]
    async fn test_reset_defaults() {
        let mut changed = RadioSettings::default();
        changed.data_stream.position_rate = 10;
        let store = MemorySettingsStore::new(changed);

        let defaults = store.reset_defaults().await.unwrap();
        assert_eq!(defaults, RadioSettings::default());
        assert_eq!(store.load().await.unwrap(), RadioSettings::default());
    }

    #[tokio::test]
    async fn test_file_export_import() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("radio.json");

        let mut settings = RadioSettings::default();
        settings.remote.network_id = 7;
        settings.data_stream.heartbeat_rate = 0.5;

        let store = MemorySettingsStore::default();
        store.save_file(&path, &settings).await.unwrap();

        let other = MemorySettingsStore::default();
        let loaded = other.load_file(&path).await.unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(other.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let store = MemorySettingsStore::default();
        let result = store.load_file(Path::new("/nonexistent/radio.json")).await;
        assert!(matches!(result, Err(GcsError::Io(_))));
    }
}
