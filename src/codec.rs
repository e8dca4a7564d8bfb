//! Decoders for the binary payloads exposed by the node firmware.
//!
//! Everything in here is pure: bytes in, structured data or `FormatError`
//! out. No I/O, no state. The one knob is [`CoordinateEncoding`], because
//! deployed firmwares disagree on whether coordinates and distances are
//! little-endian i32 millimeters or little-endian f32 meters. The caller
//! picks the encoding in its config; it is never guessed from the payload.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::messages::DeviceRole;

/// Characteristic UUIDs fixed in the deployed node firmware.
pub mod uuids {
    use uuid::Uuid;

    /// Network node service, advertised by tags and anchors alike.
    pub const NETWORK_NODE_SERVICE: Uuid = Uuid::from_u128(0x680c21d9_c946_4c1f_9c11_baa1c21329e7);
    /// Device label (GAP device name).
    pub const LABEL: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
    pub const OPERATION_MODE: Uuid = Uuid::from_u128(0x3f0afd88_7770_46b0_b5e7_9fc099598964);
    /// One writable byte selecting frame mode 0/1/2.
    pub const LOCATION_DATA_MODE: Uuid = Uuid::from_u128(0xa02b947e_df97_4516_996a_1882521e0ead);
    pub const LOCATION_DATA: Uuid = Uuid::from_u128(0x003bbdf2_c634_4b3d_ab56_7ec889b89a37);
    pub const UPDATE_RATE: Uuid = Uuid::from_u128(0x7bd47f30_5602_4389_b069_8305731308b6);
    // Anchor-only characteristics.
    pub const DEVICE_INFO: Uuid = Uuid::from_u128(0x1e63b1eb_d4ed_444e_af54_c1e965192501);
    pub const PERSISTED_POSITION: Uuid = Uuid::from_u128(0xf0f26c9b_2c8c_49ac_ab60_fe03def1b40c);
    pub const MAC_STATS: Uuid = Uuid::from_u128(0x28d01d60_89de_4bfa_b6e9_651ba596232c);
    pub const CLUSTER_INFO: Uuid = Uuid::from_u128(0x17b1613e_98f2_4436_bcde_23af17a10c72);
    pub const ANCHOR_LIST: Uuid = Uuid::from_u128(0x5b10c428_af2f_486f_aee1_9dbd79b6bccb);
    #[allow(dead_code)]
    pub const PROXY_POSITIONS: Uuid = Uuid::from_u128(0xf4a67d7d_379d_4183_9c03_4b6ea5103291);
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{what}: expected exactly {expected} bytes, got {actual}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what}: need at least {min} bytes, got {actual}")]
    Short {
        what: &'static str,
        min: usize,
        actual: usize,
    },
    #[error("unknown location frame mode {0}")]
    UnknownMode(u8),
    #[error("reserved uwb mode value {0}")]
    ReservedUwbMode(u8),
    #[error("no decoder for characteristic {0}")]
    UnknownCharacteristic(Uuid),
}

/// Wire encoding of coordinate and distance fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde_derive::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateEncoding {
    /// Little-endian i32, millimeters, scaled to meters on decode.
    #[default]
    Millimeters,
    /// Little-endian f32, meters as-is.
    Meters,
}

impl CoordinateEncoding {
    fn field(self, bytes: [u8; 4]) -> f64 {
        match self {
            CoordinateEncoding::Millimeters => f64::from(i32::from_le_bytes(bytes)) / 1000.0,
            CoordinateEncoding::Meters => f64::from(f32::from_le_bytes(bytes)),
        }
    }
}

/// A resolved position in meters with its 0-255 quality factor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub quality: u8,
}

/// One anchor-to-tag range measurement, distance in meters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeMeasurement {
    pub anchor_id: u16,
    pub distance: f64,
    pub quality: u8,
}

/// A decoded location-data frame, tagged by its wire mode.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSample {
    /// Mode 0.
    Position(Position),
    /// Mode 1.
    Ranging(Vec<RangeMeasurement>),
    /// Mode 2.
    Combined {
        position: Position,
        ranging: Vec<RangeMeasurement>,
    },
}

impl LocationSample {
    pub fn mode(&self) -> u8 {
        match self {
            LocationSample::Position(_) => 0,
            LocationSample::Ranging(_) => 1,
            LocationSample::Combined { .. } => 2,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            LocationSample::Position(p) => Some(p),
            LocationSample::Combined { position, .. } => Some(position),
            LocationSample::Ranging(_) => None,
        }
    }

    pub fn ranging(&self) -> Option<&[RangeMeasurement]> {
        match self {
            LocationSample::Ranging(r) => Some(r),
            LocationSample::Combined { ranging, .. } => Some(ranging),
            LocationSample::Position(_) => None,
        }
    }
}

/// Decode a location-data frame, dispatching on the leading mode byte.
pub fn decode_location(buf: &[u8], enc: CoordinateEncoding) -> Result<LocationSample, FormatError> {
    let (&mode, rest) = buf.split_first().ok_or(FormatError::Short {
        what: "location frame",
        min: 1,
        actual: 0,
    })?;
    match mode {
        0 => Ok(LocationSample::Position(decode_position(rest, enc)?)),
        1 => Ok(LocationSample::Ranging(decode_ranging(rest, enc)?)),
        2 => {
            // 14-byte position block (mode byte + 13-byte payload), ranging after.
            if buf.len() < 14 {
                return Err(FormatError::Short {
                    what: "combined location frame",
                    min: 14,
                    actual: buf.len(),
                });
            }
            Ok(LocationSample::Combined {
                position: decode_position(&buf[1..14], enc)?,
                ranging: decode_ranging(&buf[14..], enc)?,
            })
        }
        other => Err(FormatError::UnknownMode(other)),
    }
}

/// Decode a 13-byte position payload: x, y, z then one quality byte.
pub fn decode_position(buf: &[u8], enc: CoordinateEncoding) -> Result<Position, FormatError> {
    if buf.len() < 13 {
        return Err(FormatError::Short {
            what: "position payload",
            min: 13,
            actual: buf.len(),
        });
    }
    Ok(Position {
        x: enc.field(buf[0..4].try_into().unwrap()),
        y: enc.field(buf[4..8].try_into().unwrap()),
        z: enc.field(buf[8..12].try_into().unwrap()),
        quality: buf[12],
    })
}

/// Decode a ranging block: count byte then 7-byte entries.
///
/// Yields at most as many entries as both the declared count and the
/// remaining bytes allow. A truncated trailing entry is dropped, never an
/// error; the firmware routinely declares more entries than fit the MTU.
pub fn decode_ranging(
    buf: &[u8],
    enc: CoordinateEncoding,
) -> Result<Vec<RangeMeasurement>, FormatError> {
    let (&count, entries) = buf.split_first().ok_or(FormatError::Short {
        what: "ranging block",
        min: 1,
        actual: 0,
    })?;
    Ok(entries
        .chunks_exact(7)
        .take(count as usize)
        .map(|entry| RangeMeasurement {
            anchor_id: u16::from_le_bytes([entry[0], entry[1]]),
            distance: enc.field(entry[2..6].try_into().unwrap()),
            quality: entry[6],
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UwbMode {
    Off,
    Passive,
    Active,
}

/// Decoded 2-byte operation-mode characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMode {
    pub role: DeviceRole,
    pub uwb_mode: UwbMode,
    /// Bit 4: firmware 2 selected instead of firmware 1.
    pub firmware2_selected: bool,
    pub accelerometer_enabled: bool,
    pub led_enabled: bool,
    pub firmware_update_enabled: bool,
    /// Anchor-only.
    pub initiator_enabled: bool,
    /// Tag-only.
    pub low_power_mode: bool,
    /// Tag-only.
    pub location_engine_enabled: bool,
}

pub fn decode_operation_mode(buf: &[u8]) -> Result<OperationMode, FormatError> {
    if buf.len() != 2 {
        return Err(FormatError::Length {
            what: "operation mode",
            expected: 2,
            actual: buf.len(),
        });
    }
    let uwb_mode = match (buf[0] & 0x60) >> 5 {
        0 => UwbMode::Off,
        1 => UwbMode::Passive,
        2 => UwbMode::Active,
        reserved => return Err(FormatError::ReservedUwbMode(reserved)),
    };
    Ok(OperationMode {
        role: if buf[0] & 0x80 != 0 {
            DeviceRole::Anchor
        } else {
            DeviceRole::Tag
        },
        uwb_mode,
        firmware2_selected: buf[0] & 0x10 != 0,
        accelerometer_enabled: buf[0] & 0x08 != 0,
        led_enabled: buf[0] & 0x04 != 0,
        firmware_update_enabled: buf[0] & 0x02 != 0,
        initiator_enabled: buf[1] & 0x80 != 0,
        low_power_mode: buf[1] & 0x40 != 0,
        location_engine_enabled: buf[1] & 0x20 != 0,
    })
}

impl OperationMode {
    #[allow(dead_code)]
    pub fn encode(&self) -> [u8; 2] {
        let mut first = match self.uwb_mode {
            UwbMode::Off => 0u8,
            UwbMode::Passive => 1 << 5,
            UwbMode::Active => 2 << 5,
        };
        if self.role == DeviceRole::Anchor {
            first |= 0x80;
        }
        if self.firmware2_selected {
            first |= 0x10;
        }
        if self.accelerometer_enabled {
            first |= 0x08;
        }
        if self.led_enabled {
            first |= 0x04;
        }
        if self.firmware_update_enabled {
            first |= 0x02;
        }
        let mut second = 0u8;
        if self.initiator_enabled {
            second |= 0x80;
        }
        if self.low_power_mode {
            second |= 0x40;
        }
        if self.location_engine_enabled {
            second |= 0x20;
        }
        [first, second]
    }
}

/// Decoded device-info characteristic (29 bytes, longer payloads tolerated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 8-byte node id, surfaced as hex.
    pub node_id: String,
    pub hw_version: u32,
    pub fw1_version: u32,
    pub fw2_version: u32,
    pub fw1_checksum: u32,
    pub fw2_checksum: u32,
    pub bridge: bool,
}

pub fn decode_device_info(buf: &[u8]) -> Result<DeviceInfo, FormatError> {
    if buf.len() < 29 {
        return Err(FormatError::Short {
            what: "device info",
            min: 29,
            actual: buf.len(),
        });
    }
    let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
    Ok(DeviceInfo {
        node_id: hex::encode(&buf[0..8]),
        hw_version: word(8),
        fw1_version: word(12),
        fw2_version: word(16),
        fw1_checksum: word(20),
        fw2_checksum: word(24),
        bridge: buf[28] & 0x80 != 0,
    })
}

/// Payload of one anchor-only auxiliary characteristic.
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorAux {
    PersistedPosition(Position),
    MacStats(u32),
    ClusterInfo {
        seat: u8,
        cluster_map: u16,
        neighbor_map: u16,
    },
    AnchorList(Vec<u16>),
}

/// Decode an anchor-only characteristic payload by its UUID.
///
/// Unlike the variable-length ranging list these are all fixed-size, so any
/// length mismatch is an error.
pub fn decode_anchor_aux(
    characteristic: Uuid,
    buf: &[u8],
    enc: CoordinateEncoding,
) -> Result<AnchorAux, FormatError> {
    let exact = |what, expected: usize| {
        if buf.len() == expected {
            Ok(())
        } else {
            Err(FormatError::Length {
                what,
                expected,
                actual: buf.len(),
            })
        }
    };
    match characteristic {
        uuids::PERSISTED_POSITION => {
            exact("persisted position", 13)?;
            Ok(AnchorAux::PersistedPosition(decode_position(buf, enc)?))
        }
        uuids::MAC_STATS => {
            exact("mac stats", 4)?;
            Ok(AnchorAux::MacStats(u32::from_le_bytes(
                buf.try_into().unwrap(),
            )))
        }
        uuids::CLUSTER_INFO => {
            exact("cluster info", 5)?;
            Ok(AnchorAux::ClusterInfo {
                seat: buf[0],
                cluster_map: u16::from_le_bytes([buf[1], buf[2]]),
                neighbor_map: u16::from_le_bytes([buf[3], buf[4]]),
            })
        }
        uuids::ANCHOR_LIST => {
            exact("anchor list", 33)?;
            let count = (buf[0] as usize).min(16);
            Ok(AnchorAux::AnchorList(
                buf[1..1 + 2 * count]
                    .chunks_exact(2)
                    .map(|id| u16::from_le_bytes([id[0], id[1]]))
                    .collect(),
            ))
        }
        other => Err(FormatError::UnknownCharacteristic(other)),
    }
}

/// Encode the 8-byte update-rate payload: moving then stationary interval,
/// both in milliseconds.
pub fn encode_update_rate(moving_ms: u32, stationary_ms: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&moving_ms.to_le_bytes());
    out[4..].copy_from_slice(&stationary_ms.to_le_bytes());
    out
}

pub fn decode_update_rate(buf: &[u8]) -> Result<(u32, u32), FormatError> {
    if buf.len() != 8 {
        return Err(FormatError::Length {
            what: "update rate",
            expected: 8,
            actual: buf.len(),
        });
    }
    Ok((
        u32::from_le_bytes(buf[..4].try_into().unwrap()),
        u32::from_le_bytes(buf[4..].try_into().unwrap()),
    ))
}

/// One entry of a proxy-positions notification from a bridge node.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPosition {
    pub node_id: u16,
    pub position: Position,
}

/// Decode a proxy-positions frame: count byte then 15-byte entries of
/// `[u16 id][x][y][z][quality]`. Truncated tail entries are dropped.
#[allow(dead_code)]
pub fn decode_proxy_positions(
    buf: &[u8],
    enc: CoordinateEncoding,
) -> Result<Vec<ProxyPosition>, FormatError> {
    let (&count, entries) = buf.split_first().ok_or(FormatError::Short {
        what: "proxy positions",
        min: 1,
        actual: 0,
    })?;
    entries
        .chunks_exact(15)
        .take(count as usize)
        .map(|entry| {
            Ok(ProxyPosition {
                node_id: u16::from_le_bytes([entry[0], entry[1]]),
                position: decode_position(&entry[2..], enc)?,
            })
        })
        .collect()
}
