use std::{fmt, str::FromStr};

use aes::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, KeyIvInit,
};

use crate::{
    dash::SegmentDescriptor,
    error::{GatewayError, GatewayResult},
};

mod engine;

pub use engine::{DecryptedTracks, SegmentDecryptor};

pub const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// A ClearKey `<key_id_hex>:<key_hex>` pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ClearKeyCredential {
    pub key_id: [u8; 16],
    pub key: [u8; 16],
}

impl ClearKeyCredential {
    pub fn key_id_hex(&self) -> String {
        hex::encode(self.key_id)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// The canonical `<key_id_hex>:<key_hex>` form.
    pub fn license_key(&self) -> String {
        format!("{}:{}", self.key_id_hex(), self.key_hex())
    }
}

impl fmt::Debug for ClearKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearKeyCredential")
            .field("key_id", &self.key_id_hex())
            .field("key", &"<redacted>")
            .finish()
    }
}

fn decode_half(name: &str, value: &str) -> GatewayResult<[u8; 16]> {
    let cleaned: String = value.trim().chars().filter(|c| *c != '-').collect();
    if cleaned.is_empty() {
        return Err(GatewayError::CredentialFormat(format!("{name} is empty")));
    }
    let bytes = hex::decode(&cleaned)
        .map_err(|e| GatewayError::CredentialFormat(format!("{name} is not valid hex: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        GatewayError::CredentialFormat(format!("{name} must be 16 bytes, got {len}"))
    })
}

impl FromStr for ClearKeyCredential {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_id, key) = s.trim().split_once(':').ok_or_else(|| {
            GatewayError::CredentialFormat("expected <key_id>:<key>".to_string())
        })?;

        Ok(Self {
            key_id: decode_half("key id", key_id)?,
            key: decode_half("key", key)?,
        })
    }
}

/// Supplies the CBC initialisation vector for a media segment.
pub trait IvSource: Send + Sync {
    fn iv_for(&self, segment: &SegmentDescriptor) -> [u8; 16];
}

/// The all-zero IV.
///
/// This is not what Common Encryption specifies: CENC carries per-sample IVs
/// in the `tenc`/`senc` boxes and encrypts samples rather than whole
/// segments. It matches sources that encrypt entire segments with a zero IV.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroIv;

impl IvSource for ZeroIv {
    fn iv_for(&self, _segment: &SegmentDescriptor) -> [u8; 16] {
        [0; 16]
    }
}

/// One IV for every segment.
#[derive(Debug, Clone, Copy)]
pub struct FixedIv(pub [u8; 16]);

impl IvSource for FixedIv {
    fn iv_for(&self, _segment: &SegmentDescriptor) -> [u8; 16] {
        self.0
    }
}

/// The big-endian segment number, as used by HLS for keys without an IV.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceIv;

impl IvSource for SequenceIv {
    fn iv_for(&self, segment: &SegmentDescriptor) -> [u8; 16] {
        (segment.number as u128).to_be_bytes()
    }
}

/// AES-128-CBC decryption of a whole segment.
///
/// PKCS7 padding is removed when valid. Otherwise the plaintext is returned
/// as-is, since some sources encrypt block-aligned payloads without padding.
pub fn decrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> GatewayResult<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(GatewayError::Decryption(format!(
            "ciphertext length {} is not a multiple of {AES_BLOCK_SIZE}",
            data.len()
        )));
    }

    match Aes128CbcDec::new(key.into(), iv.into()).decrypt_padded_vec_mut::<Pkcs7>(data) {
        Ok(plain) => Ok(plain),
        Err(_) => Aes128CbcDec::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|e| GatewayError::Decryption(e.to_string())),
    }
}
