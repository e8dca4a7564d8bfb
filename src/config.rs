use std::time::Duration;

use serde_derive::Deserialize;

use crate::codec::CoordinateEncoding;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub registry: Option<RegistryConfig>,
    pub scan: Option<ScanConfig>,
    pub session: Option<SessionConfig>,
    pub codec: Option<CodecConfig>,
    pub dispatch: Option<DispatchConfig>,
}

impl AppConfig {
    pub fn registry(&self) -> RegistryConfig {
        self.registry.clone().unwrap_or_default()
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn coordinate_encoding(&self) -> CoordinateEncoding {
        self.codec
            .as_ref()
            .and_then(|c| c.coordinate_encoding)
            .unwrap_or_default()
    }

    pub fn dispatch_interval(&self) -> Duration {
        let seconds = self
            .dispatch
            .as_ref()
            .and_then(|d| d.interval_seconds)
            .unwrap_or(1);
        Duration::from_secs(seconds)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub topic: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl BackendConfig {
    /// Full endpoint: the base url plus the optional topic path.
    pub fn endpoint(&self) -> String {
        match self.topic.as_deref() {
            Some(topic) => format!("{}/{}", self.url.trim_end_matches('/'), topic),
            None => self.url.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(5))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RegistryConfig {
    pub path: Option<String>,
}

impl RegistryConfig {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("modules.json")
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interval_seconds: Option<u64>,
    pub discovery_timeout_seconds: Option<u64>,
    pub anchor_check_interval_seconds: Option<u64>,
    /// Upper bound on simultaneously connected devices.
    pub max_connections: Option<usize>,
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(60))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_seconds.unwrap_or(10))
    }

    pub fn anchor_check_interval(&self) -> Duration {
        Duration::from_secs(self.anchor_check_interval_seconds.unwrap_or(30))
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(2).max(1)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SessionConfig {
    pub connect_timeout_seconds: Option<u64>,
    pub io_timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_seconds: Option<u64>,
    pub backoff_cap_seconds: Option<u64>,
    /// Location frame mode written during configuration (0, 1 or 2).
    pub frame_mode: Option<u8>,
    pub movement_threshold_meters: Option<f64>,
    pub moving_interval_seconds: Option<u64>,
    pub stationary_interval_seconds: Option<u64>,
    pub liveness_interval_seconds: Option<u64>,
    pub update_rate: Option<UpdateRateConfig>,
    /// Also read the anchor-only diagnostic characteristics during an
    /// anchor snapshot and log them.
    pub anchor_deep_read: Option<bool>,
}

/// On-device update rates pushed to tags during configuration.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct UpdateRateConfig {
    pub moving_ms: u32,
    pub stationary_ms: u32,
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.unwrap_or(20))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_seconds.unwrap_or(5))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3).max(1)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds.unwrap_or(2))
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_seconds.unwrap_or(30))
    }

    pub fn frame_mode(&self) -> u8 {
        self.frame_mode.filter(|mode| *mode <= 2).unwrap_or(2)
    }

    pub fn movement_threshold(&self) -> f64 {
        self.movement_threshold_meters.unwrap_or(0.1)
    }

    pub fn moving_interval(&self) -> Duration {
        Duration::from_secs(self.moving_interval_seconds.unwrap_or(1))
    }

    pub fn stationary_interval(&self) -> Duration {
        Duration::from_secs(self.stationary_interval_seconds.unwrap_or(10))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_seconds.unwrap_or(15))
    }

    pub fn anchor_deep_read(&self) -> bool {
        self.anchor_deep_read.unwrap_or(false)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct CodecConfig {
    pub coordinate_encoding: Option<CoordinateEncoding>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DispatchConfig {
    pub interval_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [backend]
            url = "http://172.16.0.166:5000"
            topic = "uwb"
            timeout_seconds = 3

            [registry]
            path = "md.json"

            [scan]
            interval_seconds = 120
            max_connections = 4

            [session]
            max_retries = 5
            frame_mode = 0
            movement_threshold_meters = 0.25

            [codec]
            coordinate_encoding = "meters"
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.backend.endpoint(), "http://172.16.0.166:5000/uwb");
        assert_eq!(config.backend.timeout(), Duration::from_secs(3));
        assert_eq!(config.registry().path(), "md.json");
        assert_eq!(config.scan().interval(), Duration::from_secs(120));
        assert_eq!(config.scan().max_connections(), 4);
        assert_eq!(config.session().max_retries(), 5);
        assert_eq!(config.session().frame_mode(), 0);
        assert_eq!(config.session().movement_threshold(), 0.25);
        assert_eq!(config.coordinate_encoding(), CoordinateEncoding::Meters);
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::de::from_str(
            r#"
            [backend]
            url = "http://localhost:5000/uwb"
        "#,
        )
        .unwrap();
        assert_eq!(config.backend.endpoint(), "http://localhost:5000/uwb");
        assert_eq!(config.registry().path(), "modules.json");
        assert_eq!(config.scan().max_connections(), 2);
        assert_eq!(config.session().frame_mode(), 2);
        assert_eq!(config.session().stationary_interval(), Duration::from_secs(10));
        assert_eq!(config.coordinate_encoding(), CoordinateEncoding::Millimeters);
        assert_eq!(config.dispatch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_frame_mode_falls_back() {
        let config: AppConfig = toml::de::from_str(
            r#"
            [backend]
            url = "http://localhost:5000"

            [session]
            frame_mode = 7
        "#,
        )
        .unwrap();
        assert_eq!(config.session().frame_mode(), 2);
    }
}
