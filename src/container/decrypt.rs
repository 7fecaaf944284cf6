//! Content decryption
//!
//! Reads the rights record out of a repaired container, unwraps the content
//! key with the device's RSA key, and clears every entry the encryption
//! manifest lists. The manifest itself is dropped from the output archive;
//! everything unlisted is copied byte-exact.

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::crypto::aes::{BLOCK_SIZE, aes_cbc_decrypt};
use crate::crypto::padding::pkcs7_unpad;
use crate::crypto::rsa::{load_private_key, unwrap_content_key};
use crate::error::{DecryptError, RepairError};
use crate::model::{CONTENT_KEY_LEN, ContentScheme};
use crate::rights::RightsRecord;

use super::{
    AES128_CBC_ALGORITHM, ENCRYPTION_MANIFEST_PATH, EncryptedContainer, ManifestEntry,
    MIMETYPE_PATH, RIGHTS_PATH, validate_layout, zip_entry_names, zip_read_entry_opt,
};

/// A fully decrypted container held in memory
///
/// Carries no encryption manifest; the rights record stays in place as
/// provenance. The media-type layout rules still hold.
#[derive(Clone)]
pub struct DecryptedContainer {
    bytes: Vec<u8>,
}

impl DecryptedContainer {
    /// Open a decrypted container from raw archive bytes, validating layout
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RepairError> {
        validate_layout(&bytes)?;
        Ok(DecryptedContainer { bytes })
    }

    /// The raw archive bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the container, returning the raw archive bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Write the archive to a file
    pub fn write_path(&self, path: impl AsRef<Path>) -> Result<(), RepairError> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }

    /// Entry names in archive order
    pub fn entry_names(&self) -> Result<Vec<String>, RepairError> {
        zip_entry_names(&self.bytes)
    }

    /// Whether the archive has an entry under this exact name
    pub fn has_entry(&self, name: &str) -> Result<bool, RepairError> {
        Ok(zip_read_entry_opt(&self.bytes, name)?.is_some())
    }

    /// Read an entry, failing when it is absent
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, RepairError> {
        zip_read_entry_opt(&self.bytes, name)?
            .ok_or_else(|| RepairError::corrupt(format!("missing entry '{name}'")))
    }

    /// Read an entry, returning None when it is absent
    pub fn read_entry_opt(&self, name: &str) -> Result<Option<Vec<u8>>, RepairError> {
        zip_read_entry_opt(&self.bytes, name)
    }
}

impl fmt::Debug for DecryptedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecryptedContainer({} bytes)", self.bytes.len())
    }
}

/// Decrypt every manifest-listed entry using the scheme the rights record selects
///
/// The container must already carry its rights record; a container that
/// reaches this point without one indicates the stages ran out of order,
/// reported as [`DecryptError::MissingRightsRecord`].
pub fn decrypt(
    container: &EncryptedContainer,
    device_key_der: &[u8],
) -> Result<DecryptedContainer, DecryptError> {
    decrypt_with_scheme(container, device_key_der, None)
}

/// Decrypt with an explicit content scheme instead of the record's default
///
/// Used when a vendor deviates from the scheme its schema version implies;
/// `None` falls back to [`decrypt`] behavior.
pub fn decrypt_with_scheme(
    container: &EncryptedContainer,
    device_key_der: &[u8],
    scheme_override: Option<ContentScheme>,
) -> Result<DecryptedContainer, DecryptError> {
    let rights_xml = container
        .read_entry_opt(RIGHTS_PATH)?
        .ok_or(DecryptError::MissingRightsRecord)?;
    let record = RightsRecord::parse(&String::from_utf8_lossy(&rights_xml))?;

    let scheme = scheme_override.unwrap_or_else(|| record.schema_version.default_scheme());

    let private_key =
        load_private_key(device_key_der).map_err(|e| DecryptError::KeyMismatch(e.to_string()))?;
    let content_key =
        unwrap_content_key(&private_key, &record.encrypted_content_key, scheme.key_wrap)
            .map_err(|e| DecryptError::KeyMismatch(e.to_string()))?;
    if content_key.len() != CONTENT_KEY_LEN {
        return Err(DecryptError::KeyMismatch(format!(
            "unwrapped content key is {} bytes, expected {CONTENT_KEY_LEN}",
            content_key.len()
        )));
    }
    let mut key = [0u8; CONTENT_KEY_LEN];
    key.copy_from_slice(&content_key);

    let manifest = container.encryption_manifest()?.ok_or_else(|| {
        DecryptError::Container(RepairError::corrupt(format!(
            "container has no '{ENCRYPTION_MANIFEST_PATH}'"
        )))
    })?;
    if manifest.entries.is_empty() {
        return Err(DecryptError::Container(RepairError::corrupt(
            "encryption manifest lists no entries",
        )));
    }

    let mut cleartexts: HashMap<String, Vec<u8>> = HashMap::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        if entry.path == MIMETYPE_PATH {
            return Err(DecryptError::Container(RepairError::corrupt(
                "encryption manifest lists the media-type entry",
            )));
        }
        if entry.algorithm != AES128_CBC_ALGORITHM {
            return Err(DecryptError::Container(RepairError::corrupt(format!(
                "entry '{}' declares unsupported algorithm '{}'",
                entry.path, entry.algorithm
            ))));
        }
        let payload = container.read_entry_opt(&entry.path)?.ok_or_else(|| {
            DecryptError::Container(RepairError::corrupt(format!(
                "manifest references missing entry '{}'",
                entry.path
            )))
        })?;
        let cleartext = decrypt_entry(&key, scheme, entry, &payload)?;
        cleartexts.insert(entry.path.clone(), cleartext);
    }

    let bytes = rebuild(container, &cleartexts)?;
    Ok(DecryptedContainer::from_bytes(bytes)?)
}

/// Decrypt one manifest entry's payload to its cleartext
fn decrypt_entry(
    key: &[u8; CONTENT_KEY_LEN],
    scheme: ContentScheme,
    entry: &ManifestEntry,
    payload: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let corrupt = |detail: String| DecryptError::corrupt_entry(entry.path.as_str(), detail);

    let (iv, body) = scheme.iv.split(payload).ok_or_else(|| {
        corrupt(format!(
            "payload is {} bytes, too short to carry an IV",
            payload.len()
        ))
    })?;
    let padded = aes_cbc_decrypt(key, iv, body).map_err(|e| corrupt(e.to_string()))?;
    let mut cleartext = pkcs7_unpad(&padded, BLOCK_SIZE).map_err(|e| corrupt(e.to_string()))?;

    if entry.is_deflated() {
        let mut inflated = Vec::new();
        let mut decoder = DeflateDecoder::new(cleartext.as_slice());
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| corrupt(format!("deflate stream is invalid: {e}")))?;
        cleartext = inflated;
    }

    if let Some(expected) = entry.original_length {
        if cleartext.len() as u64 != expected {
            return Err(corrupt(format!(
                "cleartext is {} bytes, manifest declares {expected}",
                cleartext.len()
            )));
        }
    }
    Ok(cleartext)
}

/// Rewrite the archive with decrypted entries in place and the manifest dropped
fn rebuild(
    container: &EncryptedContainer,
    cleartexts: &HashMap<String, Vec<u8>>,
) -> Result<Vec<u8>, RepairError> {
    let mut archive = ZipArchive::new(Cursor::new(container.as_bytes()))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = entry.name().to_string();
        if name == ENCRYPTION_MANIFEST_PATH {
            continue;
        }
        if let Some(cleartext) = cleartexts.get(&name) {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file(name.as_str(), options)?;
            writer.write_all(cleartext)?;
        } else {
            writer.raw_copy_file(entry)?;
        }
    }
    Ok(writer.finish()?.into_inner())
}
