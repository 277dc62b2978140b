//! Versioned, authenticated, self-describing encryption envelopes.
//!
//! An envelope is the base64 text form of:
//!
//! ```text
//! version 1 (AEAD):      [1: 0x01][16: salt][12: nonce][16: GCM tag][ciphertext]
//! version 2 (CBC+HMAC):  [1: 0x02][16: salt][16: IV][32: HMAC][ciphertext]
//! ```
//!
//! The version byte alone decides how the rest is decoded. Version 1 is
//! written whenever AES-256-GCM is available; version 2 is the fallback and
//! remains readable everywhere.
//!
//! For version 2 the key material is `PBKDF2(passphrase, salt, 64)`, split
//! into an encryption key and an authentication key, and the MAC covers
//! `IV || ciphertext || len(AAD) as u32 LE || AAD` so associated data is
//! bound even though CBC itself carries none.
//!
//! A fresh salt and nonce/IV are drawn for every call to [`seal`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, IV_LEN, KEY_LEN, MAC_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Algorithm discriminator stored in byte 0 of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeVersion {
    /// AES-256-GCM.
    Aead = 1,
    /// AES-256-CBC (PKCS#7) with encrypt-then-MAC HMAC-SHA256.
    CbcHmac = 2,
}

impl EnvelopeVersion {
    /// Parse a version byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Aead),
            2 => Ok(Self::CbcHmac),
            version => Err(VaultError::UnsupportedVersion { version }),
        }
    }

    /// The byte written at offset 0.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Length of the fixed-size prefix (version byte included).
    pub fn header_len(self) -> usize {
        match self {
            Self::Aead => 1 + SALT_LEN + NONCE_LEN + TAG_LEN,
            Self::CbcHmac => 1 + SALT_LEN + IV_LEN + MAC_LEN,
        }
    }

    /// The version [`seal`] uses on this platform.
    pub fn preferred() -> Self {
        if crypto::aead_available() {
            Self::Aead
        } else {
            tracing::debug!("AES-256-GCM unavailable, falling back to CBC+HMAC envelopes");
            Self::CbcHmac
        }
    }
}

impl std::fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aead => f.write_str("v1/aes-256-gcm"),
            Self::CbcHmac => f.write_str("v2/aes-256-cbc+hmac-sha256"),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` into a base64 envelope using the preferred version.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] for an empty passphrase or a
/// cipher failure.
pub fn seal(plaintext: &[u8], passphrase: &[u8], aad: Option<&[u8]>) -> Result<String> {
    seal_with(EnvelopeVersion::preferred(), plaintext, passphrase, aad)
}

/// Encrypt `plaintext` into a base64 envelope of an explicit `version`.
pub fn seal_with(
    version: EnvelopeVersion,
    plaintext: &[u8],
    passphrase: &[u8],
    aad: Option<&[u8]>,
) -> Result<String> {
    if passphrase.is_empty() {
        return Err(VaultError::EncryptionFailed {
            reason: "passphrase required".into(),
        });
    }

    let aad = aad.unwrap_or_default();
    let salt = crypto::random_array::<SALT_LEN>()?;

    let bytes = match version {
        EnvelopeVersion::Aead => seal_aead(plaintext, passphrase, &salt, aad)?,
        EnvelopeVersion::CbcHmac => seal_cbc_hmac(plaintext, passphrase, &salt, aad)?,
    };

    Ok(BASE64.encode(bytes))
}

/// Decrypt a base64 envelope produced by [`seal`] or [`seal_with`].
///
/// # Errors
///
/// - [`VaultError::Format`] for invalid base64 or a truncated layout.
/// - [`VaultError::UnsupportedVersion`] for an unknown version byte.
/// - [`VaultError::Authentication`] when the tag/MAC does not verify.
pub fn open(envelope: &str, passphrase: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
    let data = decode(envelope)?;
    let version = EnvelopeVersion::from_byte(data[0])?;

    if data.len() < version.header_len() {
        return Err(VaultError::format(format!(
            "{version} envelope is {} bytes, need at least {}",
            data.len(),
            version.header_len()
        )));
    }

    let aad = aad.unwrap_or_default();
    let plaintext = match version {
        EnvelopeVersion::Aead => open_aead(&data, passphrase, aad)?,
        EnvelopeVersion::CbcHmac => open_cbc_hmac(&data, passphrase, aad)?,
    };

    tracing::trace!(%version, plaintext_len = plaintext.len(), "envelope opened");
    Ok(plaintext)
}

/// Read the version byte of an envelope without decrypting it.
pub fn peek_version(envelope: &str) -> Result<EnvelopeVersion> {
    let data = decode(envelope)?;
    EnvelopeVersion::from_byte(data[0])
}

// ---------------------------------------------------------------------------
// Version 1: AES-256-GCM
// ---------------------------------------------------------------------------

fn seal_aead(plaintext: &[u8], passphrase: &[u8], salt: &[u8; SALT_LEN], aad: &[u8]) -> Result<Vec<u8>> {
    let mut key = [0u8; KEY_LEN];
    crypto::derive_key(passphrase, salt, &mut key);
    let nonce = crypto::random_array::<NONCE_LEN>()?;

    let (ciphertext, tag) = crypto::aead_seal(&key, nonce, aad, plaintext)?;

    let mut out = Vec::with_capacity(EnvelopeVersion::Aead.header_len() + ciphertext.len());
    out.push(EnvelopeVersion::Aead.as_byte());
    out.extend_from_slice(salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_aead(data: &[u8], passphrase: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut fields = Fields::new(data);
    let salt: [u8; SALT_LEN] = fields.take()?;
    let nonce: [u8; NONCE_LEN] = fields.take()?;
    let tag: [u8; TAG_LEN] = fields.take()?;
    let ciphertext = fields.rest();

    let mut key = [0u8; KEY_LEN];
    crypto::derive_key(passphrase, &salt, &mut key);

    crypto::aead_open(&key, nonce, aad, ciphertext, &tag)
}

// ---------------------------------------------------------------------------
// Version 2: AES-256-CBC + HMAC-SHA256
// ---------------------------------------------------------------------------

fn seal_cbc_hmac(
    plaintext: &[u8],
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let mut material = [0u8; KEY_LEN * 2];
    crypto::derive_key(passphrase, salt, &mut material);
    let (enc_key, auth_key) = material.split_at(KEY_LEN);

    let iv = crypto::random_array::<IV_LEN>()?;
    let ciphertext = crypto::cbc_encrypt(enc_key, &iv, plaintext)?;
    let mac = crypto::hmac_sign(auth_key, &mac_input(&iv, &ciphertext, aad));

    let mut out = Vec::with_capacity(EnvelopeVersion::CbcHmac.header_len() + ciphertext.len());
    out.push(EnvelopeVersion::CbcHmac.as_byte());
    out.extend_from_slice(salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_cbc_hmac(data: &[u8], passphrase: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut fields = Fields::new(data);
    let salt: [u8; SALT_LEN] = fields.take()?;
    let iv: [u8; IV_LEN] = fields.take()?;
    let mac: [u8; MAC_LEN] = fields.take()?;
    let ciphertext = fields.rest();

    let mut material = [0u8; KEY_LEN * 2];
    crypto::derive_key(passphrase, &salt, &mut material);
    let (enc_key, auth_key) = material.split_at(KEY_LEN);

    // Authenticate before touching the padding.
    crypto::hmac_verify(auth_key, &mac_input(&iv, ciphertext, aad), &mac)?;
    crypto::cbc_decrypt(enc_key, &iv, ciphertext)
}

/// `iv || ciphertext || len(aad) as u32 LE || aad`
fn mac_input(iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Vec<u8> {
    let aad_len = (aad.len() as u32).to_le_bytes();
    let mut input = Vec::with_capacity(iv.len() + ciphertext.len() + aad_len.len() + aad.len());
    input.extend_from_slice(iv);
    input.extend_from_slice(ciphertext);
    input.extend_from_slice(&aad_len);
    input.extend_from_slice(aad);
    input
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode(envelope: &str) -> Result<Vec<u8>> {
    let data = BASE64
        .decode(envelope.trim())
        .map_err(|e| VaultError::format(format!("invalid base64: {e}")))?;
    if data.is_empty() {
        return Err(VaultError::format("empty envelope"));
    }
    Ok(data)
}

/// Cursor over the fixed-size fields following the version byte.
struct Fields<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 1 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.offset + N;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| VaultError::format("envelope truncated inside header"))?;
        self.offset = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &[u8] = b"correct horse battery staple";

    #[test]
    fn seal_prefers_aead() {
        let envelope = seal(b"{}", PASS, None).unwrap();
        assert_eq!(peek_version(&envelope).unwrap(), EnvelopeVersion::Aead);
    }

    #[test]
    fn both_versions_roundtrip() {
        for version in [EnvelopeVersion::Aead, EnvelopeVersion::CbcHmac] {
            let envelope = seal_with(version, b"{\"gold\":100}", PASS, None).unwrap();
            assert_eq!(peek_version(&envelope).unwrap(), version);
            assert_eq!(open(&envelope, PASS, None).unwrap(), b"{\"gold\":100}");
        }
    }

    #[test]
    fn cbc_hmac_binds_associated_data() {
        let envelope =
            seal_with(EnvelopeVersion::CbcHmac, b"payload", PASS, Some(b"Stats")).unwrap();

        assert_eq!(open(&envelope, PASS, Some(b"Stats")).unwrap(), b"payload");
        assert!(matches!(
            open(&envelope, PASS, Some(b"Inventory")),
            Err(VaultError::Authentication)
        ));
        assert!(matches!(
            open(&envelope, PASS, None),
            Err(VaultError::Authentication)
        ));
    }

    #[test]
    fn aad_length_prefix_prevents_shifting() {
        // Moving bytes between ciphertext and AAD must not produce the same MAC.
        let a = mac_input(&[0u8; 16], b"abc", b"d");
        let b = mac_input(&[0u8; 16], b"ab", b"cd");
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut raw = BASE64.decode(seal(b"x", PASS, None).unwrap()).unwrap();
        raw[0] = 9;
        let result = open(&BASE64.encode(raw), PASS, None);
        assert!(matches!(
            result,
            Err(VaultError::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn truncated_header_is_format_error() {
        let raw = BASE64.decode(seal(b"x", PASS, None).unwrap()).unwrap();
        let truncated = BASE64.encode(&raw[..20]);
        assert!(matches!(
            open(&truncated, PASS, None),
            Err(VaultError::Format { .. })
        ));
    }

    #[test]
    fn garbage_is_format_error() {
        assert!(matches!(
            open("not base64 at all!!", PASS, None),
            Err(VaultError::Format { .. })
        ));
        assert!(matches!(open("", PASS, None), Err(VaultError::Format { .. })));
    }

    #[test]
    fn empty_passphrase_rejected() {
        assert!(matches!(
            seal(b"x", b"", None),
            Err(VaultError::EncryptionFailed { .. })
        ));
    }

    #[test]
    fn header_lengths_match_layout() {
        assert_eq!(EnvelopeVersion::Aead.header_len(), 45);
        assert_eq!(EnvelopeVersion::CbcHmac.header_len(), 65);
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let envelope = seal(b"line", PASS, None).unwrap();
        assert_eq!(open(&format!("{envelope}\n"), PASS, None).unwrap(), b"line");
    }
}
