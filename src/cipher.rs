//! Payload encryption and decryption for the Tuya local protocol.
//! AES-128-ECB for v3.1 through v3.4 (v3.1 additionally Base64-armored),
//! AES-128-GCM for v3.5, plus the MD5/HMAC primitives the framing needs.

use crate::error::{Error, Result};
use crate::protocol::Version;
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Per-device cipher state.
///
/// Holds the provisioned local key and, for v3.4/v3.5 connections, the
/// negotiated session key. All crypto uses the session key once one is
/// installed; tearing down the connection clears it again.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 16],
    session_key: Option<[u8; 16]>,
    version: Version,
}

impl Cipher {
    /// Create a cipher from a 16-byte local key.
    pub fn new(key: &[u8], version: Version) -> Result<Self> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| Error::Config(format!("local key must be 16 bytes, got {}", key.len())))?;
        Ok(Self {
            key,
            session_key: None,
            version,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Install the negotiated session key; subsequent traffic uses it.
    pub fn set_session_key(&mut self, key: [u8; 16]) {
        self.session_key = Some(key);
    }

    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }

    /// The key in effect: session key when negotiated, local key otherwise.
    pub fn active_key(&self) -> &[u8; 16] {
        self.session_key.as_ref().unwrap_or(&self.key)
    }

    /// The provisioned local key, regardless of any session key.
    pub fn local_key(&self) -> &[u8; 16] {
        &self.key
    }

    /// Encrypt a payload the way the cipher's protocol version frames it.
    ///
    /// v3.1 yields Base64 text bytes; v3.2/v3.3 yield raw ECB blocks with
    /// PKCS#7 padding; v3.4 requires the caller to have padded to a block
    /// boundary already; v3.5 yields `nonce ++ ciphertext ++ tag`.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_1 => {
                let ct = self.encrypt_ecb(data, true)?;
                Ok(general_purpose::STANDARD.encode(&ct).into_bytes())
            }
            Version::V3_2 | Version::V3_3 => self.encrypt_ecb(data, true),
            Version::V3_4 => self.encrypt_ecb(data, false),
            Version::V3_5 => self.encrypt_gcm(data, &Self::gcm_nonce(), &[]),
        }
    }

    /// Decrypt a payload, stripping any version preamble the wire format
    /// embeds. Fails with [`Error::Decrypt`] when the primitive rejects.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_1 => {
                // "3.1" + 16 hex signature chars precede the Base64 body.
                let body = if data.starts_with(b"3.1") && data.len() > 19 {
                    &data[19..]
                } else {
                    data
                };
                let ct = general_purpose::STANDARD
                    .decode(body)
                    .map_err(|_| Error::Decrypt)?;
                self.decrypt_ecb(&ct, true)
            }
            Version::V3_2 | Version::V3_3 => {
                let body = strip_version_header(data, self.version);
                self.decrypt_ecb(body, true)
            }
            Version::V3_4 => {
                let pt = self.decrypt_ecb(data, true)?;
                Ok(strip_version_header(&pt, self.version).to_vec())
            }
            Version::V3_5 => {
                if data.len() < 12 + 16 {
                    return Err(Error::Decrypt);
                }
                let (nonce, ct) = data.split_at(12);
                self.decrypt_gcm(nonce, ct, &[])
            }
        }
    }

    /// AES-128-ECB under the active key. With `pad`, PKCS#7 padding is
    /// applied (a full extra block when the input is already aligned);
    /// without it the input must already sit on a 16-byte boundary.
    pub fn encrypt_ecb(&self, data: &[u8], pad: bool) -> Result<Vec<u8>> {
        let mut buf = if pad {
            pkcs7_pad(data)
        } else {
            if !data.len().is_multiple_of(16) {
                return Err(Error::Payload(format!(
                    "unpadded ECB input of {} bytes",
                    data.len()
                )));
            }
            data.to_vec()
        };

        let key = *self.active_key();
        let mut encryptor = Encryptor::<Aes128>::new(&key.into());
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        Ok(buf)
    }

    /// AES-128-ECB decryption under the active key. With `strip_pad`, the
    /// trailing fill bytes are verified and removed.
    pub fn decrypt_ecb(&self, data: &[u8], strip_pad: bool) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(Error::Decrypt);
        }

        let key = *self.active_key();
        let mut decryptor = Decryptor::<Aes128>::new(&key.into());
        let mut buf = data.to_vec();
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        if strip_pad { pkcs7_unpad(buf) } else { Ok(buf) }
    }

    /// AES-128-GCM seal under the active key. Output is
    /// `nonce ++ ciphertext ++ tag`, the layout the v3.5 frame carries.
    pub fn encrypt_gcm(&self, data: &[u8], nonce: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let gcm = Aes128Gcm::new(self.active_key().into());
        let payload = Payload { msg: data, aad };
        let mut ct = gcm
            .encrypt(Nonce::from_slice(&nonce[..12]), payload)
            .map_err(|_| Error::Decrypt)?;
        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce[..12]);
        out.append(&mut ct);
        Ok(out)
    }

    /// AES-128-GCM open under the active key. `data` is ciphertext with
    /// the 16-byte tag appended; a tag mismatch fails [`Error::Decrypt`].
    pub fn decrypt_gcm(&self, nonce: &[u8], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let gcm = Aes128Gcm::new(self.active_key().into());
        let payload = Payload { msg: data, aad };
        gcm.decrypt(Nonce::from_slice(&nonce[..12]), payload)
            .map_err(|_| Error::Decrypt)
    }

    /// HMAC-SHA256 over `data` under the active key (v3.4 frame trailer
    /// and the session-key negotiation proofs).
    pub fn hmac(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.active_key())
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// HMAC-SHA256 under the local key, ignoring any session key. The
    /// handshake proofs are always keyed by the provisioned secret.
    pub fn hmac_local(&self, data: &[u8]) -> [u8; 32] {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// The v3.1 request signature: characters 8..24 of
    /// `md5("data=" ++ ciphertext ++ "||lpv=3.1||" ++ key)` in lowercase hex.
    pub fn payload_signature(&self, ciphertext: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(ciphertext);
        hasher.update(b"||lpv=3.1||");
        hasher.update(self.key);
        let digest = hex::encode(hasher.finalize());
        digest[8..24].to_string()
    }

    /// Cryptographically secure random bytes (handshake nonces).
    pub fn random_bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut buf);
        buf
    }

    /// The v3.5 GCM nonce: current epoch milliseconds times ten, rendered
    /// as decimal text and truncated to 12 bytes.
    pub fn gcm_nonce() -> [u8; 12] {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let text = (ms * 10).to_string();
        let mut nonce = [b'0'; 12];
        for (slot, b) in nonce.iter_mut().zip(text.bytes()) {
            *slot = b;
        }
        nonce
    }
}

/// Strip the `"3.x" + 12 zero bytes` plaintext preamble if present.
fn strip_version_header(data: &[u8], version: Version) -> &[u8] {
    if data.len() >= 15 && &data[..3] == version.as_str().as_bytes() {
        &data[15..]
    } else {
        data
    }
}

pub(crate) fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = 16 - data.len() % 16;
    let mut buf = Vec::with_capacity(data.len() + pad);
    buf.extend_from_slice(data);
    buf.resize(data.len() + pad, pad as u8);
    buf
}

fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let Some(&pad) = data.last() else {
        return Ok(data);
    };
    let pad = pad as usize;
    if pad == 0 || pad > 16 || pad > data.len() {
        return Err(Error::Decrypt);
    }
    if !data[data.len() - pad..].iter().all(|&b| b == pad as u8) {
        return Err(Error::Decrypt);
    }
    data.truncate(data.len() - pad);
    Ok(data)
}
