/// Size of the packed binary flag record in bytes.
pub const FLAG_RAW_LEN: usize = 24;

/// Length of the base64 body between the braces.
/// 24 raw bytes encode to exactly 32 characters without padding.
pub const FLAG_B64_LEN: usize = 32;

/// Bytes of the record covered by the MAC (everything before the MAC field).
pub const FLAG_BODY_LEN: usize = 8;

/// Truncated HMAC-SHA256 tag length. The full 32-byte digest is cut to 16.
pub const FLAG_MAC_LEN: usize = 16;

/// HMAC key length in raw bytes. Configured as 64 hex characters.
pub const FLAG_KEY_LEN: usize = 32;

/// Default wire prefix in front of the `{...}` envelope.
pub const DEFAULT_FLAG_PREFIX: &str = "SAAR";

/// Service ids at or above this value are diagnostic probes, not game flags.
pub const DIAGNOSTIC_SERVICE_MIN: u16 = 0xFFFE;

/// Diagnostic probe that reports the submitter's team id.
pub const SERVICE_TEAM_PROBE: u16 = 0xFFFE;

/// Diagnostic probe that reports the full server status.
pub const SERVICE_STATUS_PROBE: u16 = 0xFFFF;

/// Highest round number of regularly issued flags.
/// The high bit marks flags issued for testing purposes.
pub const MAX_PRODUCTION_ROUND: u16 = 0x7FFF;
