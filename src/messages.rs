use std::time::{SystemTime, UNIX_EPOCH};

use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

use crate::codec::LocationSample;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Tag,
    Anchor,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Disable,
}

/// A registry entry for one known physical node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub id: MacAddress,
    pub name: String,
    #[serde(rename = "type", default)]
    pub role: DeviceRole,
    #[serde(default)]
    pub status: DeviceStatus,
}

/// The location part of a record: decoded when the frame parsed, the raw
/// hex otherwise so the backend still sees what the device sent.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationReading {
    Decoded(LocationSample),
    Raw(String),
}

/// One decoded observation of a device, handed from a session to the
/// dispatcher. The dispatcher owns it until it is sent or superseded by a
/// fresher record for the same device.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub identity: DeviceIdentity,
    /// Raw operation-mode bytes as hex, when they were read this cycle.
    pub operation: Option<String>,
    pub location: Option<LocationReading>,
    pub status: DeviceStatus,
    /// Unix timestamp, seconds.
    pub time: f64,
}

impl TelemetryRecord {
    pub fn new(
        identity: DeviceIdentity,
        operation: Option<String>,
        location: Option<LocationReading>,
        status: DeviceStatus,
    ) -> Self {
        TelemetryRecord {
            identity,
            operation,
            location,
            status,
            time: unix_time(),
        }
    }
}

pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_registry_json() {
        let json = r#"{"id": "EB:52:53:F5:D5:90", "name": "tag-entrance", "type": "tag", "status": "active"}"#;
        let identity: DeviceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.name, "tag-entrance");
        assert_eq!(identity.role, DeviceRole::Tag);
        assert_eq!(identity.status, DeviceStatus::Active);

        let back = serde_json::to_string(&identity).unwrap();
        assert!(back.contains(r#""type":"tag""#));
        assert!(back.contains(r#""status":"active""#));
    }

    #[test]
    fn missing_role_and_status_default() {
        let json = r#"{"id": "C8:70:52:60:9F:38", "name": "new-module"}"#;
        let identity: DeviceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.role, DeviceRole::Unknown);
        assert_eq!(identity.status, DeviceStatus::Active);
    }
}
