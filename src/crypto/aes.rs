//! AES-128-CBC for container content entries
//!
//! Content entries are enciphered block by block; the container layer picks
//! the IV out of each entry per the active [`crate::model::IvConvention`]
//! and validates padding after decryption.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

use crate::error::CryptoError;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Decrypt AES-128-CBC ciphertext
///
/// Returns the raw plaintext with padding still attached; callers validate
/// and strip it with [`super::padding::pkcs7_unpad`].
pub fn aes_cbc_decrypt(
    key: &[u8; BLOCK_SIZE],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidIv(BLOCK_SIZE));
    }
    if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(BLOCK_SIZE) {
        return Err(CryptoError::NotBlockAligned);
    }

    let cipher = Aes128::new(key.into());
    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut prev = [0u8; BLOCK_SIZE];
    prev.copy_from_slice(iv);

    for chunk in ciphertext.chunks_exact(BLOCK_SIZE) {
        let mut block = *GenericArray::from_slice(chunk);
        cipher.decrypt_block(&mut block);
        let decrypted: [u8; BLOCK_SIZE] = block.into();
        for i in 0..BLOCK_SIZE {
            plaintext.push(decrypted[i] ^ prev[i]);
        }
        prev.copy_from_slice(chunk);
    }

    Ok(plaintext)
}

/// Encrypt plaintext with AES-128-CBC, applying PKCS#7 padding first
///
/// The IV is not prepended; callers that follow the ciphertext-prefix
/// convention concatenate it themselves.
pub fn aes_cbc_encrypt(key: &[u8; BLOCK_SIZE], iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let padded = super::padding::pkcs7_pad(plaintext, BLOCK_SIZE);
    let cipher = Aes128::new(key.into());
    let mut ciphertext = Vec::with_capacity(padded.len());
    let mut prev = *iv;

    for chunk in padded.chunks_exact(BLOCK_SIZE) {
        let mut mixed = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_SIZE {
            mixed[i] = chunk[i] ^ prev[i];
        }
        let mut block = GenericArray::from(mixed);
        cipher.encrypt_block(&mut block);
        let encrypted: [u8; BLOCK_SIZE] = block.into();
        ciphertext.extend_from_slice(&encrypted);
        prev = encrypted;
    }

    ciphertext
}
