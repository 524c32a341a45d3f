//! Wire framing for the Tuya local protocol.
//! Builds and parses 0x55AA / 0x6699 frames with CRC-32, HMAC-SHA256, or
//! AES-GCM integrity depending on the protocol version.

use crate::cipher::{Cipher, pkcs7_pad};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const PREFIX_55AA: u32 = 0x0000_55AA;
pub const PREFIX_6699: u32 = 0x0000_6699;
pub const SUFFIX_55AA: u32 = 0x0000_AA55;
pub const SUFFIX_6699: u32 = 0x0000_9966;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Protocol version spoken by a device.
///
/// The version selects the frame magic, the cipher algorithm, whether a
/// session-key handshake runs at connect time, and which commands carry
/// the plaintext version header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    #[default]
    V3_1,
    V3_2,
    V3_3,
    V3_4,
    V3_5,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V3_1 => "3.1",
            Version::V3_2 => "3.2",
            Version::V3_3 => "3.3",
            Version::V3_4 => "3.4",
            Version::V3_5 => "3.5",
        }
    }

    /// Frame magic this version opens with.
    pub fn prefix(&self) -> u32 {
        match self {
            Version::V3_5 => PREFIX_6699,
            _ => PREFIX_55AA,
        }
    }

    /// Frame magic this version closes with.
    pub fn suffix(&self) -> u32 {
        match self {
            Version::V3_5 => SUFFIX_6699,
            _ => SUFFIX_55AA,
        }
    }

    /// Whether a connection must negotiate a session key before use.
    pub fn requires_handshake(&self) -> bool {
        matches!(self, Version::V3_4 | Version::V3_5)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3.1" => Ok(Version::V3_1),
            "3.2" => Ok(Version::V3_2),
            "3.3" => Ok(Version::V3_3),
            "3.4" => Ok(Version::V3_4),
            "3.5" => Ok(Version::V3_5),
            other => Err(Error::Config(format!(
                "unsupported protocol version '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command codes of the local protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    Udp = 0x00,
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegRes = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    DpRefresh = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    BroadcastLpv34 = 0x23,
    LanExtStream = 0x40,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use CommandType::*;
        Some(match value {
            0x00 => Udp,
            0x01 => ApConfig,
            0x02 => Active,
            0x03 => SessKeyNegStart,
            0x04 => SessKeyNegRes,
            0x05 => SessKeyNegFinish,
            0x06 => Unbind,
            0x07 => Control,
            0x08 => Status,
            0x09 => HeartBeat,
            0x0a => DpQuery,
            0x0b => QueryWifi,
            0x0c => TokenBind,
            0x0d => ControlNew,
            0x0e => EnableWifi,
            0x0f => WifiInfo,
            0x10 => DpQueryNew,
            0x11 => SceneExecute,
            0x12 => DpRefresh,
            0x13 => UdpNew,
            0x14 => ApConfigNew,
            0x23 => BroadcastLpv34,
            0x40 => LanExtStream,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for CommandType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::from_u32(value).ok_or(Error::InvalidCommand(value))
    }
}

/// An outbound frame before encoding.
#[derive(Debug, Clone)]
pub struct FrameOut<'a> {
    pub seq: u32,
    pub command: CommandType,
    pub payload: &'a [u8],
    /// v3.1 only: wrap the payload in the Base64 + MD5-signature preamble.
    /// Later versions always encrypt and ignore this flag.
    pub encrypted: bool,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameIn {
    pub seq: u32,
    pub command: u32,
    pub return_code: Option<u32>,
    pub payload: FramePayload,
    pub version: Version,
}

impl FrameIn {
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u32(self.command)
    }
}

/// Payload of a decoded frame after decryption and classification.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Decrypted (or plaintext) JSON.
    Json(Value),
    /// UTF-8 text that is not JSON, e.g. the `"json obj data unvalid"`
    /// literal quirky firmwares reply with.
    Text(String),
    /// Binary payload (session-key negotiation material).
    Raw(Vec<u8>),
    Empty,
}

impl FramePayload {
    pub fn is_empty(&self) -> bool {
        matches!(self, FramePayload::Empty)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            FramePayload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FramePayload::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Raw bytes for binary and textual payloads.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FramePayload::Raw(b) => Some(b),
            FramePayload::Text(t) => Some(t.as_bytes()),
            _ => None,
        }
    }

    /// Collapse into a JSON value for resolution toward awaiters.
    pub fn into_value(self) -> Value {
        match self {
            FramePayload::Json(v) => v,
            FramePayload::Text(t) => Value::String(t),
            FramePayload::Raw(b) => Value::String(hex::encode(b)),
            FramePayload::Empty => Value::Null,
        }
    }
}

/// Whether this command carries the `"3.x" + 12 zero bytes` plaintext
/// header for the given version.
fn uses_version_header(version: Version, command: CommandType) -> bool {
    use CommandType::*;
    match version {
        Version::V3_1 => false,
        Version::V3_2 | Version::V3_3 => !matches!(command, DpQuery | DpRefresh),
        Version::V3_4 | Version::V3_5 => !matches!(
            command,
            DpQuery
                | HeartBeat
                | DpQueryNew
                | SessKeyNegStart
                | SessKeyNegRes
                | SessKeyNegFinish
                | DpRefresh
        ),
    }
}

fn with_version_header(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(15 + payload.len());
    out.extend_from_slice(version.as_str().as_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(payload);
    out
}

/// Encode a frame for the cipher's protocol version.
pub fn encode(cipher: &Cipher, frame: &FrameOut) -> Result<Vec<u8>> {
    match cipher.version() {
        Version::V3_1 => encode_v31(cipher, frame),
        Version::V3_2 | Version::V3_3 => encode_ecb(cipher, frame),
        Version::V3_4 => encode_v34(cipher, frame),
        Version::V3_5 => encode_v35(cipher, frame, &Cipher::gcm_nonce()),
    }
}

/// Encode a v3.5 frame with an explicit GCM nonce. The handshake reuses
/// the local nonce here; everything else goes through [`encode`].
pub fn encode_with_nonce(cipher: &Cipher, frame: &FrameOut, nonce: &[u8; 12]) -> Result<Vec<u8>> {
    encode_v35(cipher, frame, nonce)
}

fn encode_v31(cipher: &Cipher, frame: &FrameOut) -> Result<Vec<u8>> {
    let body = if frame.encrypted {
        let ct = cipher.encrypt(frame.payload)?;
        let signature = cipher.payload_signature(&ct);
        let mut body = Vec::with_capacity(19 + ct.len());
        body.extend_from_slice(b"3.1");
        body.extend_from_slice(signature.as_bytes());
        body.extend_from_slice(&ct);
        body
    } else {
        frame.payload.to_vec()
    };
    crc_frame(frame.seq, frame.command as u32, &body)
}

fn encode_ecb(cipher: &Cipher, frame: &FrameOut) -> Result<Vec<u8>> {
    let ct = cipher.encrypt(frame.payload)?;
    let body = if uses_version_header(cipher.version(), frame.command) {
        with_version_header(cipher.version(), &ct)
    } else {
        ct
    };
    crc_frame(frame.seq, frame.command as u32, &body)
}

fn encode_v34(cipher: &Cipher, frame: &FrameOut) -> Result<Vec<u8>> {
    let plain = if uses_version_header(Version::V3_4, frame.command) {
        with_version_header(Version::V3_4, frame.payload)
    } else {
        frame.payload.to_vec()
    };
    let ct = cipher.encrypt(&pkcs7_pad(&plain))?;

    let mut out = Vec::with_capacity(16 + ct.len() + 36);
    out.write_u32::<BigEndian>(PREFIX_55AA)?;
    out.write_u32::<BigEndian>(frame.seq)?;
    out.write_u32::<BigEndian>(frame.command as u32)?;
    out.write_u32::<BigEndian>((ct.len() + 0x24) as u32)?;
    out.extend_from_slice(&ct);
    let mac = cipher.hmac(&out);
    out.extend_from_slice(&mac);
    out.write_u32::<BigEndian>(SUFFIX_55AA)?;
    Ok(out)
}

fn encode_v35(cipher: &Cipher, frame: &FrameOut, nonce: &[u8; 12]) -> Result<Vec<u8>> {
    let plain = if uses_version_header(Version::V3_5, frame.command) {
        with_version_header(Version::V3_5, frame.payload)
    } else {
        frame.payload.to_vec()
    };

    // Header: prefix, 2 reserved bytes, seq, cmd, length. Length counts
    // the 12-byte nonce and 16-byte tag; bytes 4..18 feed GCM as AAD.
    let mut out = Vec::with_capacity(18 + plain.len() + 28 + 4);
    out.write_u32::<BigEndian>(PREFIX_6699)?;
    out.write_u16::<BigEndian>(0)?;
    out.write_u32::<BigEndian>(frame.seq)?;
    out.write_u32::<BigEndian>(frame.command as u32)?;
    out.write_u32::<BigEndian>((plain.len() + 28) as u32)?;

    let sealed = cipher.encrypt_gcm(&plain, nonce, &out[4..18])?;
    out.extend_from_slice(&sealed);
    out.write_u32::<BigEndian>(SUFFIX_6699)?;
    Ok(out)
}

fn crc_frame(seq: u32, command: u32, body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + body.len() + 8);
    out.write_u32::<BigEndian>(PREFIX_55AA)?;
    out.write_u32::<BigEndian>(seq)?;
    out.write_u32::<BigEndian>(command)?;
    out.write_u32::<BigEndian>((body.len() + 8) as u32)?;
    out.extend_from_slice(body);
    out.write_u32::<BigEndian>(CRC32.checksum(&out))?;
    out.write_u32::<BigEndian>(SUFFIX_55AA)?;
    Ok(out)
}

/// Total on-wire length of the frame starting at `buf`, or `None` when
/// more bytes are needed to tell. Used by the session's streaming reads.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    match BigEndian::read_u32(&buf[..4]) {
        PREFIX_55AA => {
            if buf.len() < 16 {
                return Ok(None);
            }
            Ok(Some(16 + BigEndian::read_u32(&buf[12..16]) as usize))
        }
        PREFIX_6699 => {
            if buf.len() < 18 {
                return Ok(None);
            }
            Ok(Some(18 + BigEndian::read_u32(&buf[14..18]) as usize + 4))
        }
        other => Err(Error::PrefixMismatch(other)),
    }
}

/// Decode a buffer holding one or more whole frames, in order.
pub fn decode(cipher: &Cipher, buf: &[u8]) -> Result<Vec<FrameIn>> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < 24 {
            return Err(Error::TruncatedPayload {
                needed: 24,
                have: rest.len(),
            });
        }
        let total = frame_len(rest)?.expect("24 bytes cover any header");
        if rest.len() < total {
            return Err(Error::TruncatedPayload {
                needed: total,
                have: rest.len(),
            });
        }
        frames.push(decode_single(cipher, &rest[..total])?);
        rest = &rest[total..];
    }
    Ok(frames)
}

fn decode_single(cipher: &Cipher, frame: &[u8]) -> Result<FrameIn> {
    let suffix = BigEndian::read_u32(&frame[frame.len() - 4..]);
    match BigEndian::read_u32(&frame[..4]) {
        PREFIX_55AA => {
            if suffix != SUFFIX_55AA {
                return Err(Error::SuffixMismatch);
            }
            decode_55aa(cipher, frame)
        }
        PREFIX_6699 => {
            if suffix != SUFFIX_6699 {
                return Err(Error::SuffixMismatch);
            }
            decode_6699(cipher, frame)
        }
        other => Err(Error::PrefixMismatch(other)),
    }
}

fn decode_55aa(cipher: &Cipher, frame: &[u8]) -> Result<FrameIn> {
    let version = cipher.version();
    let seq = BigEndian::read_u32(&frame[4..8]);
    let command = BigEndian::read_u32(&frame[8..12]);

    let trailer_len = if version == Version::V3_4 { 36 } else { 8 };
    if frame.len() < 16 + trailer_len {
        return Err(Error::TruncatedPayload {
            needed: 16 + trailer_len,
            have: frame.len(),
        });
    }
    let payload_end = frame.len() - trailer_len;

    if version == Version::V3_4 {
        let expected = &frame[payload_end..payload_end + 32];
        if cipher.hmac(&frame[..payload_end]) != expected {
            return Err(Error::HmacMismatch);
        }
    } else {
        let received = BigEndian::read_u32(&frame[payload_end..payload_end + 4]);
        if CRC32.checksum(&frame[..payload_end]) != received {
            return Err(Error::CrcMismatch);
        }
    }

    // Frames from devices carry a return code before the payload; frames
    // we built do not. Top 24 bits clear marks it present.
    let mut start = 16;
    let mut return_code = None;
    if payload_end >= start + 4 {
        let rc = BigEndian::read_u32(&frame[16..20]);
        if rc & 0xFFFF_FF00 == 0 {
            return_code = Some(rc);
            start = 20;
        }
    }

    let payload = classify(cipher, &frame[start..payload_end]);
    Ok(FrameIn {
        seq,
        command,
        return_code,
        payload,
        version,
    })
}

fn decode_6699(cipher: &Cipher, frame: &[u8]) -> Result<FrameIn> {
    let seq = BigEndian::read_u32(&frame[6..10]);
    let command = BigEndian::read_u32(&frame[10..14]);

    let body = &frame[18..frame.len() - 4];
    if body.len() < 28 {
        return Err(Error::TruncatedPayload {
            needed: 28,
            have: body.len(),
        });
    }
    let (nonce, ct) = body.split_at(12);
    let plain = cipher.decrypt_gcm(nonce, ct, &frame[4..18])?;

    let (return_code, rest) = split_retcode_v35(&plain);
    let rest = if rest.len() >= 15 && &rest[..3] == b"3.5" {
        &rest[15..]
    } else {
        rest
    };

    Ok(FrameIn {
        seq,
        command,
        return_code,
        payload: to_payload(rest.to_vec(), cipher.version()),
        version: cipher.version(),
    })
}

/// v3.5 puts the return code inside the ciphertext. Detect it the same
/// way devices' own parsers do: a non-JSON first byte followed by JSON or
/// a version header four bytes in.
fn split_retcode_v35(plain: &[u8]) -> (Option<u32>, &[u8]) {
    if plain.len() > 4 && plain[0] != b'{' && (plain[4] == b'{' || plain[4] == b'3') {
        (Some(BigEndian::read_u32(&plain[..4])), &plain[4..])
    } else {
        (None, plain)
    }
}

fn classify(cipher: &Cipher, raw: &[u8]) -> FramePayload {
    if raw.is_empty() {
        return FramePayload::Empty;
    }
    match cipher.decrypt(raw) {
        Ok(plain) => to_payload(plain, cipher.version()),
        // Not encrypted after all: plaintext status JSON, discovery
        // payloads, or quirk literals. Surface the bytes as-is.
        Err(_) => to_payload(raw.to_vec(), cipher.version()),
    }
}

fn to_payload(bytes: Vec<u8>, version: Version) -> FramePayload {
    if bytes.is_empty() {
        return FramePayload::Empty;
    }
    match String::from_utf8(bytes) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => FramePayload::Json(unwrap_envelope(value, version)),
            Err(_) => FramePayload::Text(text),
        },
        Err(err) => FramePayload::Raw(err.into_bytes()),
    }
}

/// v3.4/v3.5 replies wrap the interesting object as
/// `{protocol, t, data}`; flatten to `data` with `t` merged in.
fn unwrap_envelope(value: Value, version: Version) -> Value {
    if !matches!(version, Version::V3_4 | Version::V3_5) {
        return value;
    }
    if let Value::Object(map) = &value
        && let Some(Value::Object(data)) = map.get("data")
        && let Some(t) = map.get("t")
    {
        let mut merged = data.clone();
        merged.insert("t".to_string(), t.clone());
        return Value::Object(merged);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &[u8] = b"4226aa407d5c1e2b";

    fn cipher(version: Version) -> Cipher {
        Cipher::new(KEY, version).unwrap()
    }

    fn query_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "devId": "002004265ccf7fb1b659",
            "dps": {"1": true, "2": 0}
        }))
        .unwrap()
    }

    fn round_trip(version: Version, command: CommandType, encrypted: bool) -> FrameIn {
        let cipher = cipher(version);
        let payload = query_payload();
        let frame = FrameOut {
            seq: 1,
            command,
            payload: &payload,
            encrypted,
        };
        let bytes = encode(&cipher, &frame).unwrap();
        let mut frames = decode(&cipher, &bytes).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn v31_query_round_trip() {
        let decoded = round_trip(Version::V3_1, CommandType::DpQuery, false);
        assert_eq!(decoded.command, 10);
        assert_eq!(decoded.seq, 1);
        assert_eq!(
            decoded.payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );
    }

    #[test]
    fn v31_encrypted_control_round_trip() {
        let decoded = round_trip(Version::V3_1, CommandType::Control, true);
        assert_eq!(decoded.command, 7);
        assert_eq!(
            decoded.payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );
    }

    #[test]
    fn v33_control_round_trip() {
        let decoded = round_trip(Version::V3_3, CommandType::Control, true);
        assert_eq!(
            decoded.payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );
    }

    #[test]
    fn v33_query_skips_version_header() {
        let cipher = cipher(Version::V3_3);
        let payload = query_payload();
        let bytes = encode(
            &cipher,
            &FrameOut {
                seq: 9,
                command: CommandType::DpQuery,
                payload: &payload,
                encrypted: true,
            },
        )
        .unwrap();
        // Ciphertext directly after the 16-byte header, no "3.3" preamble.
        assert_ne!(&bytes[16..19], &b"3.3"[..]);
        let frames = decode(&cipher, &bytes).unwrap();
        assert_eq!(frames[0].seq, 9);
    }

    #[test]
    fn v34_round_trip_and_hmac_tamper() {
        let decoded = round_trip(Version::V3_4, CommandType::ControlNew, true);
        assert_eq!(
            decoded.payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );

        let cipher = cipher(Version::V3_4);
        let payload = query_payload();
        let mut bytes = encode(
            &cipher,
            &FrameOut {
                seq: 2,
                command: CommandType::ControlNew,
                payload: &payload,
                encrypted: true,
            },
        )
        .unwrap();
        let len = bytes.len();
        bytes[len - 10] ^= 0x01; // inside the 32-byte HMAC trailer
        assert_eq!(decode(&cipher, &bytes), Err(Error::HmacMismatch));
    }

    #[test]
    fn v35_round_trip_and_tag_tamper() {
        let decoded = round_trip(Version::V3_5, CommandType::ControlNew, true);
        assert_eq!(
            decoded.payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );

        let cipher = cipher(Version::V3_5);
        let payload = query_payload();
        let mut bytes = encode(
            &cipher,
            &FrameOut {
                seq: 3,
                command: CommandType::ControlNew,
                payload: &payload,
                encrypted: true,
            },
        )
        .unwrap();
        let len = bytes.len();
        bytes[len - 6] ^= 0x01; // inside the GCM tag
        assert_eq!(decode(&cipher, &bytes), Err(Error::Decrypt));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let cipher = cipher(Version::V3_1);
        let payload = query_payload();
        let frame = FrameOut {
            seq: 1,
            command: CommandType::DpQuery,
            payload: &payload,
            encrypted: false,
        };
        let one = encode(&cipher, &frame).unwrap();
        let mut two = one.clone();
        two.extend_from_slice(&one);

        let frames = decode(&cipher, &two).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
        assert_eq!(frames[0], decode(&cipher, &one).unwrap()[0]);
    }

    #[test]
    fn crc_corruption_is_detected() {
        let cipher = cipher(Version::V3_1);
        let payload = query_payload();
        let mut bytes = encode(
            &cipher,
            &FrameOut {
                seq: 1,
                command: CommandType::DpQuery,
                payload: &payload,
                encrypted: false,
            },
        )
        .unwrap();
        let len = bytes.len();
        bytes[len - 8..len - 4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert_eq!(decode(&cipher, &bytes), Err(Error::CrcMismatch));
    }

    #[test]
    fn truncation_is_detected() {
        let cipher = cipher(Version::V3_3);
        let payload = query_payload();
        let bytes = encode(
            &cipher,
            &FrameOut {
                seq: 1,
                command: CommandType::Control,
                payload: &payload,
                encrypted: true,
            },
        )
        .unwrap();
        for cut in [bytes.len() - 1, bytes.len() - 9, 30, 24] {
            assert!(matches!(
                decode(&cipher, &bytes[..cut]),
                Err(Error::TruncatedPayload { .. })
            ));
        }
    }

    #[test]
    fn bad_magic_is_detected() {
        let cipher = cipher(Version::V3_1);
        let payload = query_payload();
        let good = encode(
            &cipher,
            &FrameOut {
                seq: 1,
                command: CommandType::DpQuery,
                payload: &payload,
                encrypted: false,
            },
        )
        .unwrap();

        let mut bad_prefix = good.clone();
        bad_prefix[0] = 0xFF;
        assert!(matches!(
            decode(&cipher, &bad_prefix),
            Err(Error::PrefixMismatch(_))
        ));

        let mut bad_suffix = good;
        let len = bad_suffix.len();
        bad_suffix[len - 1] = 0x00;
        assert_eq!(decode(&cipher, &bad_suffix), Err(Error::SuffixMismatch));
    }

    #[test]
    fn device_return_code_is_stripped() {
        let cipher = cipher(Version::V3_1);
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&query_payload());
        let bytes = crc_frame(7, CommandType::Status as u32, &body).unwrap();

        let frames = decode(&cipher, &bytes).unwrap();
        assert_eq!(frames[0].return_code, Some(0));
        assert_eq!(
            frames[0].payload.as_json().unwrap(),
            &serde_json::from_slice::<Value>(&query_payload()).unwrap()
        );
    }

    #[test]
    fn empty_heartbeat_round_trips() {
        for version in [Version::V3_1, Version::V3_3, Version::V3_4] {
            let cipher = cipher(version);
            let bytes = encode(
                &cipher,
                &FrameOut {
                    seq: 4,
                    command: CommandType::HeartBeat,
                    payload: &[],
                    encrypted: false,
                },
            )
            .unwrap();
            let frames = decode(&cipher, &bytes).unwrap();
            assert!(frames[0].payload.is_empty(), "version {version}");
        }
    }

    #[test]
    fn v34_envelope_is_unwrapped() {
        let cipher = cipher(Version::V3_4);
        let payload = serde_json::to_vec(&json!({
            "protocol": 5,
            "t": 1700000000u32,
            "data": {"dps": {"1": true}}
        }))
        .unwrap();
        let bytes = encode(
            &cipher,
            &FrameOut {
                seq: 5,
                command: CommandType::Status,
                payload: &payload,
                encrypted: true,
            },
        )
        .unwrap();
        let frames = decode(&cipher, &bytes).unwrap();
        assert_eq!(
            frames[0].payload.as_json().unwrap(),
            &json!({"dps": {"1": true}, "t": 1700000000u32})
        );
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        assert_eq!(
            CommandType::try_from(0x99),
            Err(Error::InvalidCommand(0x99))
        );
        assert_eq!(CommandType::try_from(0x0a), Ok(CommandType::DpQuery));
    }

    #[test]
    fn version_parse_and_display() {
        assert_eq!("3.5".parse::<Version>().unwrap(), Version::V3_5);
        assert_eq!(Version::V3_2.to_string(), "3.2");
        assert!("4.0".parse::<Version>().is_err());
        assert!(Version::V3_4.requires_handshake());
        assert!(!Version::V3_3.requires_handshake());
    }
}
