//! Symmetric primitives behind the save-data envelope.
//!
//! This module provides the raw building blocks the [`envelope`](crate::envelope)
//! format is assembled from:
//!
//! - **AEAD**: AES-256-GCM via `ring`, with the 128-bit tag returned
//!   separately so the envelope can place it ahead of the ciphertext.
//! - **Block cipher fallback**: AES-256-CBC with PKCS#7 padding (RustCrypto
//!   `aes` + `cbc`), always paired with HMAC-SHA256 by the caller.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 producing any number of bytes.
//! - **Hashing / MAC / random**: SHA-256, HMAC-SHA256 and the system CSPRNG.
//!
//! # Security Notes
//!
//! - Every call that needs a nonce or IV takes it from the caller; the
//!   envelope layer generates a fresh one per encryption.
//! - [`hmac_verify`] compares in constant time (via `ring`).

use std::num::NonZeroU32;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::error::{Result, VaultError};

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-GCM nonce in bytes (96 bits).
pub const NONCE_LEN: usize = aead::NONCE_LEN;

/// Length of the AES-GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of the AES-CBC initialisation vector in bytes.
pub const IV_LEN: usize = 16;

/// Length of an HMAC-SHA256 output in bytes.
pub const MAC_LEN: usize = 32;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count shared by both envelope versions. Changing it
/// invalidates every existing save file.
pub const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(14_398).unwrap();

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for bound keys; each key built here
/// is used for a single seal or open.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// AEAD (AES-256-GCM)
// ---------------------------------------------------------------------------

/// Returns `true` when an AES-256-GCM key can be constructed on this
/// platform. Used to pick the preferred envelope version.
pub fn aead_available() -> bool {
    UnboundKey::new(AEAD_ALG, &[0u8; KEY_LEN]).is_ok()
}

/// Encrypt `plaintext` with AES-256-GCM under `key` and `nonce`, binding
/// `aad`.
///
/// Returns `(ciphertext, tag)`; the ciphertext has the same length as the
/// plaintext.
pub fn aead_seal(
    key: &[u8],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    let unbound = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: format!("AES-256-GCM key must be {KEY_LEN} bytes, got {}", key.len()),
    })?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    let tag = sealing_key
        .seal_in_place_separate_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "AES-256-GCM seal failed".into(),
        })?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "aead sealed"
    );

    Ok((in_out, tag_bytes))
}

/// Decrypt and authenticate an AES-256-GCM `ciphertext` with its detached
/// `tag`.
///
/// # Errors
///
/// Returns [`VaultError::Authentication`] if the key, nonce, associated data
/// or ciphertext do not match the tag.
pub fn aead_open(
    key: &[u8],
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let unbound = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::Internal(format!(
        "AES-256-GCM key must be {KEY_LEN} bytes, got {}",
        key.len()
    )))?;
    let mut opening_key = OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    // ring expects the tag appended to the ciphertext.
    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::Authentication)?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Block cipher fallback (AES-256-CBC, PKCS#7)
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-CBC and PKCS#7 padding.
///
/// The result carries no integrity protection on its own; callers must MAC
/// `iv || ciphertext`.
pub fn cbc_encrypt(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| VaultError::EncryptionFailed {
            reason: format!("AES-256-CBC key must be {KEY_LEN} bytes, got {}", key.len()),
        })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt an AES-256-CBC `ciphertext` and strip PKCS#7 padding.
///
/// # Errors
///
/// Returns [`VaultError::Format`] when the ciphertext is not a whole number
/// of blocks or the padding is invalid.
pub fn cbc_decrypt(key: &[u8], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| VaultError::Internal(format!("AES-256-CBC key must be {KEY_LEN} bytes")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::format("CBC ciphertext has invalid length or padding"))
}

// ---------------------------------------------------------------------------
// MAC / hash
// ---------------------------------------------------------------------------

/// Compute HMAC-SHA256 of `data` under `key`.
pub fn hmac_sign(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Verify an HMAC-SHA256 `mac` over `data` in constant time.
pub fn hmac_verify(key: &[u8], data: &[u8], mac: &[u8]) -> Result<()> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, data, mac).map_err(|_| VaultError::Authentication)
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Fill `out` with PBKDF2-HMAC-SHA256 key material derived from
/// `passphrase` and `salt`.
///
/// `out` may be any length; the envelope asks for 32 bytes (AEAD key) or 64
/// bytes (independent CBC and HMAC keys).
pub fn derive_key(passphrase: &[u8], salt: &[u8], out: &mut [u8]) {
    pbkdf2::derive(PBKDF2_ALG, PBKDF2_ITERATIONS, salt, passphrase, out);
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Fill `buf` from the system CSPRNG.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))
}

/// Generate `N` cryptographically secure random bytes.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill_random(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
