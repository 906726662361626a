use crate::constants::{
    DIAGNOSTIC_SERVICE_MIN, FLAG_BODY_LEN, FLAG_MAC_LEN, FLAG_RAW_LEN, MAX_PRODUCTION_ROUND,
};

/// Binary flag record (wire format, after base64 decode).
///
/// Encoding rules:
/// - Fixed size: exactly `FLAG_RAW_LEN` bytes.
/// - Integer fields are little-endian, in field order.
/// - The MAC covers the first `FLAG_BODY_LEN` bytes and is the 16-byte
///   truncation of an HMAC-SHA256 digest (see [`crate::codec::FlagCodec`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag {
    /// Round (tick) the flag was issued in.
    pub round: u16,

    /// Team the flag was planted at.
    pub team_id: u16,

    /// Service the flag belongs to. Values at or above
    /// `DIAGNOSTIC_SERVICE_MIN` mark diagnostic probes.
    pub service_id: u16,

    /// Distinguishes multiple flags per (round, team, service).
    pub payload: u16,

    /// Truncated HMAC-SHA256 tag over the four fields above.
    pub mac: [u8; FLAG_MAC_LEN],
}

impl Flag {
    /// Record size in bytes for the current wire layout.
    pub const LEN: usize = FLAG_RAW_LEN;

    /// The MAC'd part of the record: the four u16 fields, little-endian.
    pub fn body_bytes(&self) -> [u8; FLAG_BODY_LEN] {
        let mut out = [0u8; FLAG_BODY_LEN];
        out[0..2].copy_from_slice(&self.round.to_le_bytes());
        out[2..4].copy_from_slice(&self.team_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.service_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.payload.to_le_bytes());
        out
    }

    /// Serialize the full record including the MAC.
    pub fn to_bytes(&self) -> [u8; FLAG_RAW_LEN] {
        let mut out = [0u8; FLAG_RAW_LEN];
        out[..FLAG_BODY_LEN].copy_from_slice(&self.body_bytes());
        out[FLAG_BODY_LEN..].copy_from_slice(&self.mac);
        out
    }

    /// Deserialize a full record. The MAC is taken as-is; verification is a
    /// separate step on [`crate::codec::FlagCodec`].
    pub fn from_bytes(raw: [u8; FLAG_RAW_LEN]) -> Self {
        let mut mac = [0u8; FLAG_MAC_LEN];
        mac.copy_from_slice(&raw[FLAG_BODY_LEN..]);
        Self {
            round: u16::from_le_bytes([raw[0], raw[1]]),
            team_id: u16::from_le_bytes([raw[2], raw[3]]),
            service_id: u16::from_le_bytes([raw[4], raw[5]]),
            payload: u16::from_le_bytes([raw[6], raw[7]]),
            mac,
        }
    }

    /// Diagnostic probes are reachability/identity checks, not game flags.
    pub fn is_diagnostic(&self) -> bool {
        self.service_id >= DIAGNOSTIC_SERVICE_MIN
    }

    /// Flags issued for testing purposes carry the high round bit.
    pub fn is_test_issued(&self) -> bool {
        self.round > MAX_PRODUCTION_ROUND
    }
}
