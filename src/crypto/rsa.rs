//! RSA operations over raw PKCS#1 device keys
//!
//! Covers the two content-key wrap schemes the rights revisions use and the
//! PSS request signature sent during the fulfillment handshake.

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::rand_core::OsRng;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::{Decryptor, RandomizedEncryptor};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, oaep, pss};
use sha1::Sha1;

use crate::error::CryptoError;
use crate::model::KeyWrap;

/// Salt length of fulfillment request signatures, matching the SHA-1 digest
pub const SIGNATURE_SALT_LEN: usize = 20;

/// Load an RSA private key from raw PKCS#1 DER bytes
pub fn load_private_key(raw_der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_der(raw_der).map_err(|e| CryptoError::KeyParse(e.to_string()))
}

/// Unwrap a content key with the device's private key
pub fn unwrap_content_key(
    key: &RsaPrivateKey,
    wrapped: &[u8],
    wrap: KeyWrap,
) -> Result<Vec<u8>, CryptoError> {
    match wrap {
        KeyWrap::Pkcs1v15 => key
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|e| CryptoError::RsaUnwrap(e.to_string())),
        KeyWrap::OaepSha1 => oaep::DecryptingKey::<Sha1>::new(key.clone())
            .decrypt(wrapped)
            .map_err(|e| CryptoError::RsaUnwrap(e.to_string())),
    }
}

/// Wrap a content key to a device's public key
///
/// The counterpart of [`unwrap_content_key`], used by fulfillment-side
/// tooling and test fixtures.
pub fn wrap_content_key(
    key: &RsaPublicKey,
    content_key: &[u8],
    wrap: KeyWrap,
) -> Result<Vec<u8>, CryptoError> {
    let mut rng = OsRng;
    match wrap {
        KeyWrap::Pkcs1v15 => key
            .encrypt(&mut rng, Pkcs1v15Encrypt, content_key)
            .map_err(|e| CryptoError::RsaUnwrap(e.to_string())),
        KeyWrap::OaepSha1 => oaep::EncryptingKey::<Sha1>::new(key.clone())
            .encrypt_with_rng(&mut rng, content_key)
            .map_err(|e| CryptoError::RsaUnwrap(e.to_string())),
    }
}

/// Sign the canonical fulfillment request bytes with RSA-PSS over SHA-1
pub fn sign_request(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signing_key = pss::SigningKey::<Sha1>::new_with_salt_len(key.clone(), SIGNATURE_SALT_LEN);
    let mut rng = OsRng;
    let signature = signing_key
        .try_sign_with_rng(&mut rng, message)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Verify a fulfillment request signature against the device's public key
pub fn verify_request_signature(
    key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key =
        pss::VerifyingKey::<Sha1>::new_with_salt_len(key.clone(), SIGNATURE_SALT_LEN);
    let signature = pss::Signature::try_from(signature)
        .map_err(|e| CryptoError::Sign(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|e| CryptoError::Sign(e.to_string()))
}
