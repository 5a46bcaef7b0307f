//! `radio` section of the configuration file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioStreamConfig {
    #[serde(default = "RadioStreamConfig::default_stream_url")]
    pub stream_url: String,
    #[serde(default = "RadioStreamConfig::default_status_url")]
    pub status_url: String,
    /// Sent as a bearer token to the status API when present.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "RadioStreamConfig::default_station_name")]
    pub station_name: String,
    /// Initial inline volume in percent.
    #[serde(default = "RadioStreamConfig::default_volume")]
    pub default_volume: u8,
    #[serde(default = "RadioStreamConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "RadioStreamConfig::default_status_timeout")]
    pub status_timeout_seconds: u64,
}

impl RadioStreamConfig {
    fn default_stream_url() -> String {
        "http://localhost:8000/stream".to_string()
    }

    fn default_status_url() -> String {
        "http://localhost:8000/api/status".to_string()
    }

    fn default_station_name() -> String {
        "HiiZun Radio".to_string()
    }

    const fn default_volume() -> u8 {
        50
    }

    const fn default_connect_timeout() -> u64 {
        15
    }

    const fn default_status_timeout() -> u64 {
        10
    }

    pub fn from_config(config: &pmoconfig::Config) -> Self {
        config.get_section(&["radio"])
    }

    pub fn load_from_pmoconfig() -> anyhow::Result<Self> {
        let cfg = pmoconfig::get_config();
        Ok(Self::from_config(&cfg))
    }

    /// Default volume as a linear gain.
    pub fn volume_level(&self) -> f32 {
        f32::from(self.default_volume.min(100)) / 100.0
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_seconds)
    }
}

impl Default for RadioStreamConfig {
    fn default() -> Self {
        Self {
            stream_url: Self::default_stream_url(),
            status_url: Self::default_status_url(),
            access_token: None,
            station_name: Self::default_station_name(),
            default_volume: Self::default_volume(),
            connect_timeout_seconds: Self::default_connect_timeout(),
            status_timeout_seconds: Self::default_status_timeout(),
        }
    }
}
