use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::{FLAG_B64_LEN, FLAG_KEY_LEN, FLAG_MAC_LEN, FLAG_RAW_LEN};
use crate::error::FlagError;
use crate::flag::Flag;

type HmacSha256 = Hmac<Sha256>;

/// Encodes and decodes the textual flag envelope `<prefix>{<base64>}` and
/// signs/verifies the embedded record.
///
/// Encoder and decoder must agree on the base64 alphabet; this codec uses the
/// URL-safe alphabet without padding on both sides.
pub struct FlagCodec {
    prefix: String,
    mac: HmacSha256,
    wire_len: usize,
}

impl FlagCodec {
    pub fn new(prefix: &str, key: [u8; FLAG_KEY_LEN]) -> Self {
        let mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        Self {
            prefix: prefix.to_string(),
            mac,
            wire_len: prefix.len() + FLAG_B64_LEN + 2,
        }
    }

    /// Total length of a flag line on the wire, excluding the newline.
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Parse one right-trimmed submission line into a flag record.
    ///
    /// Checks, in order: total length, envelope (`prefix`, `{`, `}`), base64
    /// body decoding to exactly `FLAG_RAW_LEN` bytes. The MAC is not verified
    /// here; call [`FlagCodec::verify`] on the result.
    pub fn decode(&self, line: &[u8]) -> Result<Flag, FlagError> {
        let line = rtrim(line);
        if line.len() != self.wire_len {
            return Err(FlagError::WrongLength(line.len()));
        }

        let p = self.prefix.len();
        if line[..p] != *self.prefix.as_bytes() || line[p] != b'{' || line[self.wire_len - 1] != b'}'
        {
            return Err(FlagError::BadEnvelope);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(&line[p + 1..self.wire_len - 1])
            .map_err(|_| FlagError::BadPayload)?;
        let raw: [u8; FLAG_RAW_LEN] = raw.try_into().map_err(|_| FlagError::BadPayload)?;
        Ok(Flag::from_bytes(raw))
    }

    /// Build a signed flag record.
    pub fn sign(&self, round: u16, team_id: u16, service_id: u16, payload: u16) -> Flag {
        let mut flag = Flag {
            round,
            team_id,
            service_id,
            payload,
            mac: [0; FLAG_MAC_LEN],
        };
        flag.mac = self.mac_of(&flag.body_bytes());
        flag
    }

    /// Check the truncated MAC against the record body (constant-time).
    pub fn verify(&self, flag: &Flag) -> bool {
        let mut mac = self.mac.clone();
        mac.update(&flag.body_bytes());
        mac.verify_truncated_left(&flag.mac).is_ok()
    }

    /// Serialize a record into its wire line, newline included.
    pub fn render(&self, flag: &Flag) -> String {
        let mut out = String::with_capacity(self.wire_len + 1);
        out.push_str(&self.prefix);
        out.push('{');
        out.push_str(&URL_SAFE_NO_PAD.encode(flag.to_bytes()));
        out.push('}');
        out.push('\n');
        out
    }

    /// Sign and serialize in one step.
    pub fn encode(&self, round: u16, team_id: u16, service_id: u16, payload: u16) -> String {
        self.render(&self.sign(round, team_id, service_id, payload))
    }

    fn mac_of(&self, body: &[u8]) -> [u8; FLAG_MAC_LEN] {
        let mut mac = self.mac.clone();
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; FLAG_MAC_LEN];
        out.copy_from_slice(&digest[..FLAG_MAC_LEN]);
        out
    }
}

/// Strip trailing whitespace (and any other control bytes up to `' '`),
/// notably the `\n` and `\r` of a submission line.
pub fn rtrim(line: &[u8]) -> &[u8] {
    let mut len = line.len();
    while len > 0 && line[len - 1] <= b' ' {
        len -= 1;
    }
    &line[..len]
}

#[cfg(test)]
mod tests {
    use super::{rtrim, FlagCodec};
    use crate::constants::FLAG_KEY_LEN;
    use crate::error::FlagError;

    fn codec() -> FlagCodec {
        FlagCodec::new("SAAR", [b'a'; FLAG_KEY_LEN])
    }

    #[test]
    fn decode_known_flag() {
        let flag = codec()
            .decode(b"SAAR{OQUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}\n")
            .unwrap();
        assert_eq!(flag.round, 1337);
        assert_eq!(flag.team_id, 7);
        assert_eq!(flag.service_id, 12);
        assert_eq!(flag.payload, 0);
        assert!(codec().verify(&flag));
    }

    #[test]
    fn encode_matches_known_flag() {
        assert_eq!(
            codec().encode(1337, 7, 12, 0),
            "SAAR{OQUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}\n"
        );
    }

    #[test]
    fn forged_mac_fails_verification() {
        let flag = codec()
            .decode(b"SAAR{x_qtrZWVEQBoxEDkuVt8YreJb7pBW_XX}\n")
            .unwrap();
        assert!(!codec().verify(&flag));
    }

    #[test]
    fn round_trip_preserves_fields() {
        let codec = codec();
        for (round, team, service, payload) in [
            (0u16, 0u16, 0u16, 0u16),
            (1, 1, 1, 1),
            (1337, 42, 7, 999),
            (0x7FFF, 0xFFFE, 0xFFFF, 0xABCD),
            (u16::MAX, u16::MAX, u16::MAX, u16::MAX),
        ] {
            let line = codec.encode(round, team, service, payload);
            let flag = codec.decode(line.as_bytes()).unwrap();
            assert_eq!((flag.round, flag.team_id, flag.service_id), (round, team, service));
            assert_eq!(flag.payload, payload);
            assert!(codec.verify(&flag));
        }
    }

    #[test]
    fn any_body_bit_flip_invalidates_mac() {
        let codec = codec();
        let line = codec.encode(1337, 42, 7, 999);
        let reference = codec.decode(line.as_bytes()).unwrap();

        for byte in 0..8 {
            for bit in 0..8 {
                let mut raw = reference.to_bytes();
                raw[byte] ^= 1 << bit;
                let mutated = crate::flag::Flag::from_bytes(raw);
                assert!(!codec.verify(&mutated), "byte {byte} bit {bit}");
            }
        }

        let mut raw = reference.to_bytes();
        raw[8] ^= 1; // first MAC byte
        assert!(!codec.verify(&crate::flag::Flag::from_bytes(raw)));
    }

    #[test]
    fn decode_rejects_malformed_lines() {
        let codec = codec();
        assert_eq!(
            codec.decode(b"tooshort\n"),
            Err(FlagError::WrongLength(8))
        );
        assert_eq!(
            codec.decode(b"XAAR{OQUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}"),
            Err(FlagError::BadEnvelope)
        );
        assert_eq!(
            codec.decode(b"SAAR[OQUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9]"),
            Err(FlagError::BadEnvelope)
        );
        assert_eq!(
            codec.decode(b"SAAR{!QUHAAwAAAAlt3tF4y_TgZlNX2Yi4hw9}"),
            Err(FlagError::BadPayload)
        );
    }

    #[test]
    fn rtrim_strips_line_endings() {
        assert_eq!(rtrim(b"abc\r\n"), b"abc");
        assert_eq!(rtrim(b"abc  "), b"abc");
        assert_eq!(rtrim(b"\n"), b"");
        assert_eq!(rtrim(b""), b"");
    }
}
