//! PKCS#7 block padding

use crate::error::CryptoError;

/// Remove and validate PKCS#7 padding
///
/// Every padding byte must equal the pad length, and the pad length must be
/// between 1 and the block size. Content entries that fail this check are
/// reported as corrupt ciphertext by the container layer.
pub fn pkcs7_unpad(data: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || !data.len().is_multiple_of(block_size) {
        return Err(CryptoError::NotBlockAligned);
    }

    let pad = data[data.len() - 1] as usize;
    if pad == 0 || pad > block_size || pad > data.len() {
        return Err(CryptoError::InvalidPadding);
    }

    let boundary = data.len() - pad;
    if data[boundary..].iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::InvalidPadding);
    }

    Ok(data[..boundary].to_vec())
}

/// Apply PKCS#7 padding up to the next block boundary
///
/// Input that already ends on a boundary gains a full block of padding, so
/// the result is never empty and always unpads to the original bytes.
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad = block_size - data.len() % block_size;
    let mut padded = data.to_vec();
    padded.resize(data.len() + pad, pad as u8);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_then_unpad_restores_input() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let data: Vec<u8> = (0..len as u8).collect();
            let padded = pkcs7_pad(&data, 16);
            assert!(padded.len() % 16 == 0);
            assert!(padded.len() > data.len());
            assert_eq!(pkcs7_unpad(&padded, 16).unwrap(), data);
        }
    }

    #[test]
    fn test_full_block_of_padding_for_aligned_input() {
        let data = [7u8; 16];
        let padded = pkcs7_pad(&data, 16);
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_unpad_rejects_unaligned_and_empty() {
        assert!(matches!(
            pkcs7_unpad(&[], 16),
            Err(CryptoError::NotBlockAligned)
        ));
        assert!(matches!(
            pkcs7_unpad(&[1u8; 15], 16),
            Err(CryptoError::NotBlockAligned)
        ));
    }

    #[test]
    fn test_unpad_rejects_bad_pad_values() {
        // zero pad byte
        let mut block = [4u8; 16];
        block[15] = 0;
        assert!(matches!(
            pkcs7_unpad(&block, 16),
            Err(CryptoError::InvalidPadding)
        ));

        // pad byte larger than the block
        block[15] = 17;
        assert!(matches!(
            pkcs7_unpad(&block, 16),
            Err(CryptoError::InvalidPadding)
        ));

        // inconsistent padding run
        let mut mixed = [0u8; 16];
        mixed[14] = 3;
        mixed[15] = 2;
        assert!(matches!(
            pkcs7_unpad(&mixed, 16),
            Err(CryptoError::InvalidPadding)
        ));
    }
}
