//! Cryptographic key schedule for the Exposure Notification protocol.
//!
//! Every diagnosed-user Temporary Exposure Key (TEK) diversifies into two
//! per-TEK subkeys:
//!
//! - **RPIK**: `HKDF-SHA256(ikm = tek, salt = none, info = "EN-RPIK", 16)`,
//!   used to derive the Rolling Proximity Identifiers broadcast over BLE.
//! - **AEMK**: same construction with `info = "EN-AEMK"`, used to encrypt
//!   the 4-byte Associated Encrypted Metadata riding along each RPI.
//!
//! An RPI for interval `j` is the AES-128-ECB encryption of the padded
//! block `"EN-RPI" || 0x000000000000 || le32(j)` under the RPIK. A TEK
//! covers 144 consecutive intervals, and generating all 144 identifiers as
//! one multi-block ECB pass is significantly cheaper than 144 single-block
//! calls, so the batch path is the primary interface.
//!
//! AEM (de)cryption is AES-128-CTR under the AEMK with the full 16-byte
//! RPI as the initial counter block. Only 4 bytes of keystream are ever
//! consumed, so the counter never increments.
//!
//! All primitives come from the RustCrypto crates and are constant-time;
//! nothing here branches on secret data.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Block};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Number of bytes in a Temporary Exposure Key.
pub const TEK_LEN: usize = 16;

/// Number of bytes in a Rolling Proximity Identifier.
pub const RPI_LEN: usize = 16;

/// Number of bytes in a derived RPI key.
pub const RPIK_LEN: usize = 16;

/// Number of bytes in a derived AEM key.
pub const AEMK_LEN: usize = 16;

/// Number of bytes of Associated Encrypted Metadata per advertisement.
pub const AEM_LEN: usize = 4;

/// Number of 10-minute intervals a single TEK remains valid.
pub const TEK_ROLLING_PERIOD: u32 = 144;

/// Attenuation sentinel: the AEM could not be decrypted.
pub const ATTENUATION_INVALID: u8 = 0xFF;

/// RSSI sentinel reported by the radio when the reading saturated.
pub const RSSI_SATURATED: i8 = 127;

const RPIK_INFO: &[u8] = b"EN-RPIK";
const AEMK_INFO: &[u8] = b"EN-AEMK";
const RPI_PAD_PREFIX: &[u8; 6] = b"EN-RPI";

/// Errors produced by the key-schedule primitives.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// An input buffer had the wrong length.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Which input was malformed.
        what: &'static str,
        /// The required length in bytes.
        expected: usize,
        /// The provided length in bytes.
        actual: usize,
    },

    /// The underlying HKDF or AES backend rejected the operation.
    ///
    /// Unreachable once lengths validate, but kept so the contract is
    /// explicit at the API boundary.
    #[error("crypto backend failure: {message}")]
    Backend {
        /// Description from the backend.
        message: String,
    },
}

fn check_len(what: &'static str, expected: usize, buf: &[u8]) -> Result<(), CryptoError> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(CryptoError::InvalidLength {
            what,
            expected,
            actual: buf.len(),
        })
    }
}

/// Generates a fresh TEK from the process RNG.
#[must_use]
pub fn generate_tek() -> [u8; TEK_LEN] {
    let mut tek = [0u8; TEK_LEN];
    rand::thread_rng().fill_bytes(&mut tek);
    tek
}

fn derive_subkey(tek: &[u8], info: &[u8]) -> Result<[u8; 16], CryptoError> {
    check_len("tek", TEK_LEN, tek)?;
    let hk = Hkdf::<Sha256>::new(None, tek);
    let mut okm = [0u8; 16];
    hk.expand(info, &mut okm).map_err(|e| CryptoError::Backend {
        message: format!("hkdf expand failed: {e}"),
    })?;
    Ok(okm)
}

/// Derives the Rolling Proximity Identifier Key for a TEK.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] if `tek` is not 16 bytes.
pub fn derive_rpik(tek: &[u8]) -> Result<[u8; RPIK_LEN], CryptoError> {
    derive_subkey(tek, RPIK_INFO)
}

/// Derives the Associated Encrypted Metadata Key for a TEK.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] if `tek` is not 16 bytes.
pub fn derive_aemk(tek: &[u8]) -> Result<[u8; AEMK_LEN], CryptoError> {
    derive_subkey(tek, AEMK_INFO)
}

fn rpi_pad_block(interval_number: u32) -> Block {
    let mut padded = [0u8; RPI_LEN];
    padded[..6].copy_from_slice(RPI_PAD_PREFIX);
    padded[12..].copy_from_slice(&interval_number.to_le_bytes());
    Block::from(padded)
}

/// Derives the single RPI a TEK broadcasts during `interval_number`.
///
/// Prefer [`batch_rpi`] when expanding a whole rolling window; the batch
/// path amortizes key setup across all 144 blocks.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] if `tek` is not 16 bytes.
pub fn rpi_for(tek: &[u8], interval_number: u32) -> Result<[u8; RPI_LEN], CryptoError> {
    let rpik = derive_rpik(tek)?;
    let cipher = Aes128::new(GenericArray::from_slice(&rpik));
    let mut block = rpi_pad_block(interval_number);
    cipher.encrypt_block(&mut block);
    Ok(block.into())
}

/// Fills `out` with consecutive RPIs starting at `start_interval`.
///
/// `out` must be a non-empty multiple of 16 bytes; slot `j` receives the
/// RPI for interval `start_interval + j`. All blocks are encrypted in a
/// single ECB pass.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] if `tek` is not 16 bytes or
/// `out` is empty or not a multiple of 16 bytes.
pub fn batch_rpi_into(tek: &[u8], start_interval: u32, out: &mut [u8]) -> Result<(), CryptoError> {
    if out.is_empty() || out.len() % RPI_LEN != 0 {
        return Err(CryptoError::InvalidLength {
            what: "rpi output buffer",
            expected: RPI_LEN * TEK_ROLLING_PERIOD as usize,
            actual: out.len(),
        });
    }
    let rpik = derive_rpik(tek)?;
    let cipher = Aes128::new(GenericArray::from_slice(&rpik));

    let mut blocks: Vec<Block> = (0..out.len() / RPI_LEN)
        .map(|j| rpi_pad_block(start_interval.wrapping_add(j as u32)))
        .collect();
    cipher.encrypt_blocks(&mut blocks);

    for (slot, block) in out.chunks_exact_mut(RPI_LEN).zip(&blocks) {
        slot.copy_from_slice(block);
    }
    Ok(())
}

/// Generates the full 144-RPI rolling window for a TEK.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] if `tek` is not 16 bytes.
pub fn batch_rpi(tek: &[u8], start_interval: u32) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; RPI_LEN * TEK_ROLLING_PERIOD as usize];
    batch_rpi_into(tek, start_interval, &mut out)?;
    Ok(out)
}

fn aem_ctr(metadata: &[u8], tek: &[u8], rpi: &[u8]) -> Result<[u8; AEM_LEN], CryptoError> {
    check_len("aem", AEM_LEN, metadata)?;
    check_len("rpi", RPI_LEN, rpi)?;
    let aemk = derive_aemk(tek)?;

    let mut buf = [0u8; AEM_LEN];
    buf.copy_from_slice(metadata);
    let mut cipher = ctr::Ctr128BE::<Aes128>::new(
        GenericArray::from_slice(&aemk),
        GenericArray::from_slice(rpi),
    );
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// Encrypts 4 bytes of advertisement metadata under the TEK's AEMK, using
/// the RPI being broadcast alongside as the initial counter block.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] on any wrong-length input.
pub fn encrypt_aem(metadata: &[u8], tek: &[u8], rpi: &[u8]) -> Result<[u8; AEM_LEN], CryptoError> {
    aem_ctr(metadata, tek, rpi)
}

/// Decrypts 4 bytes of Associated Encrypted Metadata.
///
/// CTR mode is an involution, so this is the same keystream application
/// as [`encrypt_aem`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] on any wrong-length input.
pub fn decrypt_aem(
    encrypted_aem: &[u8],
    tek: &[u8],
    rpi: &[u8],
) -> Result<[u8; AEM_LEN], CryptoError> {
    aem_ctr(encrypted_aem, tek, rpi)
}

/// Extracts the signed transmit power from an encrypted AEM.
///
/// Decrypted metadata layout: `<version/flags:1> <tx power:1> <rfu:2>`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidLength`] on any wrong-length input.
pub fn tx_power_from_aem(encrypted_aem: &[u8], tek: &[u8], rpi: &[u8]) -> Result<i8, CryptoError> {
    let metadata = decrypt_aem(encrypted_aem, tek, rpi)?;
    #[allow(clippy::cast_possible_wrap)]
    let tx_power = metadata[1] as i8;
    Ok(tx_power)
}

/// Computes attenuation from an already-extracted transmit power.
///
/// A saturated reading carries no magnitude information and maps to `0`;
/// otherwise the result is `max(0, tx_power - rssi)` clamped to `u8`.
#[must_use]
pub fn attenuation_for(tx_power: i8, rssi: i8, saturated: bool) -> u8 {
    if rssi == RSSI_SATURATED && saturated {
        return 0;
    }
    let attenuation = i32::from(tx_power) - i32::from(rssi);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamped = attenuation.clamp(0, 255) as u8;
    clamped
}

/// Computes the normalized attenuation for an observed advertisement.
///
/// Returns [`ATTENUATION_INVALID`] (`0xFF`) when the AEM cannot be
/// decrypted with the given inputs, `0` when the RSSI reading saturated,
/// and the clamped `tx_power - rssi` otherwise.
#[must_use]
pub fn attenuation(tek: &[u8], rpi: &[u8], encrypted_aem: &[u8], rssi: i8, saturated: bool) -> u8 {
    match tx_power_from_aem(encrypted_aem, tek, rpi) {
        Ok(tx_power) => attenuation_for(tx_power, rssi, saturated),
        Err(_) => ATTENUATION_INVALID,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const TEK_ZERO: [u8; TEK_LEN] = [0u8; TEK_LEN];

    #[test]
    fn test_subkeys_are_distinct_and_deterministic() {
        let rpik = derive_rpik(&TEK_ZERO).unwrap();
        let aemk = derive_aemk(&TEK_ZERO).unwrap();
        assert_ne!(rpik, aemk);
        assert_eq!(rpik, derive_rpik(&TEK_ZERO).unwrap());
        assert_eq!(aemk, derive_aemk(&TEK_ZERO).unwrap());
    }

    #[test]
    fn test_single_rpi_matches_batch_slot() {
        let start = 2_649_600;
        let batch = batch_rpi(&TEK_ZERO, start).unwrap();
        for j in [0u32, 1, 71, 143] {
            let single = rpi_for(&TEK_ZERO, start + j).unwrap();
            let slot = &batch[(j as usize) * RPI_LEN..(j as usize + 1) * RPI_LEN];
            assert_eq!(&single[..], slot, "slot {j} diverged from batch");
        }
    }

    #[test]
    fn test_batch_produces_distinct_identifiers() {
        let batch = batch_rpi(&TEK_ZERO, 2_649_600).unwrap();
        let distinct: HashSet<&[u8]> = batch.chunks_exact(RPI_LEN).collect();
        assert_eq!(distinct.len(), TEK_ROLLING_PERIOD as usize);
    }

    #[test]
    fn test_aem_round_trip() {
        let tek = generate_tek();
        let rpi = rpi_for(&tek, 1000).unwrap();
        for metadata in [[0x40, 0x0C, 0, 0], [0x10, 0xF4, 0xAA, 0x55], [0; 4]] {
            let ciphertext = encrypt_aem(&metadata, &tek, &rpi).unwrap();
            assert_ne!(ciphertext, metadata);
            let plaintext = decrypt_aem(&ciphertext, &tek, &rpi).unwrap();
            assert_eq!(plaintext, metadata);
        }
    }

    #[test]
    fn test_tx_power_sign_preserved() {
        let tek = generate_tek();
        let rpi = rpi_for(&tek, 42).unwrap();
        let aem = encrypt_aem(&[0x40, 0xF4u8, 0, 0], &tek, &rpi).unwrap();
        // 0xF4 reinterpreted as signed is -12.
        assert_eq!(tx_power_from_aem(&aem, &tek, &rpi).unwrap(), -12);
    }

    #[test]
    fn test_attenuation_contract() {
        let tek = generate_tek();
        let rpi = rpi_for(&tek, 7).unwrap();
        let aem = encrypt_aem(&[0x40, 0x0C, 0, 0], &tek, &rpi).unwrap();

        // tx 12 dBm observed at -50 dBm: 62 dB path loss.
        assert_eq!(attenuation(&tek, &rpi, &aem, -50, false), 62);
        // Saturated floor reading carries no magnitude.
        assert_eq!(attenuation(&tek, &rpi, &aem, RSSI_SATURATED, true), 0);
        // rssi above tx clamps at zero rather than wrapping.
        assert_eq!(attenuation(&tek, &rpi, &aem, 100, false), 0);
        // Truncated AEM is unrecoverable.
        assert_eq!(attenuation(&tek, &rpi, &aem[..2], -50, false), ATTENUATION_INVALID);
    }

    #[test]
    fn test_invalid_lengths_are_rejected() {
        assert!(matches!(
            derive_rpik(&[0u8; 15]),
            Err(CryptoError::InvalidLength { what: "tek", .. })
        ));
        assert!(rpi_for(&[0u8; 17], 0).is_err());
        assert!(encrypt_aem(&[0u8; 3], &TEK_ZERO, &[0u8; RPI_LEN]).is_err());
        assert!(decrypt_aem(&[0u8; AEM_LEN], &TEK_ZERO, &[0u8; 15]).is_err());
        let mut odd = [0u8; 24];
        assert!(batch_rpi_into(&TEK_ZERO, 0, &mut odd).is_err());
    }
}
