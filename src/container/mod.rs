//! Encrypted document containers
//!
//! A container is a ZIP archive whose first entry must be the uncompressed
//! media-type declaration. Vendors strip the rights record before shipping;
//! [`repair`] puts a reconstructed one back and [`decrypt`] clears the
//! entries listed in the encryption manifest.
//!
//! Containers are held as owned byte buffers and a fresh ZIP view is opened
//! per operation, so values move freely between pipeline stages and worker
//! tasks.

pub mod decrypt;
pub mod repair;

pub use decrypt::{DecryptedContainer, decrypt, decrypt_with_scheme};
pub use repair::inject_rights;

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::RepairError;
use crate::xml::{XML_BUFFER_CAPACITY, local_name};

/// Path of the media-type declaration, always the first archive entry
pub const MIMETYPE_PATH: &str = "mimetype";

/// Media type of the containers this library repairs
pub const CONTAINER_MIMETYPE: &str = "application/epub+zip";

/// Path of the rights record inside a repaired container
pub const RIGHTS_PATH: &str = "META-INF/rights.xml";

/// Path of the encryption manifest listing enciphered entries
pub const ENCRYPTION_MANIFEST_PATH: &str = "META-INF/encryption.xml";

/// Manifest algorithm URI for AES-128-CBC content entries
pub const AES128_CBC_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";

/// Manifest compression method code for raw deflate
pub const DEFLATE_COMPRESSION_METHOD: u8 = 8;

/// An encrypted container held in memory
///
/// Construction validates the archive layout, so holding a value means the
/// media-type invariant held when it was opened.
#[derive(Clone)]
pub struct EncryptedContainer {
    bytes: Vec<u8>,
}

impl EncryptedContainer {
    /// Open a container from raw archive bytes, validating its layout
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RepairError> {
        validate_layout(&bytes)?;
        Ok(EncryptedContainer { bytes })
    }

    /// Open a container file
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, RepairError> {
        Self::from_bytes(std::fs::read(path)?)
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

    /// Parse the encryption manifest, if the container carries one
    pub fn encryption_manifest(&self) -> Result<Option<EncryptionManifest>, RepairError> {
        match self.read_entry_opt(ENCRYPTION_MANIFEST_PATH)? {
            Some(bytes) => {
                let xml = String::from_utf8_lossy(&bytes);
                Ok(Some(parse_manifest(&xml)?))
            }
            None => Ok(None),
        }
    }
}

impl fmt::Debug for EncryptedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedContainer({} bytes)", self.bytes.len())
    }
}

/// Parsed encryption manifest
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionManifest {
    /// One entry per enciphered archive member
    pub entries: Vec<ManifestEntry>,
}

/// One enciphered archive member as declared by the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Archive path of the member, percent-decoding already applied
    pub path: String,
    /// Algorithm URI from the EncryptionMethod element
    pub algorithm: String,
    /// Compression applied before encryption, when declared
    pub compression_method: Option<u8>,
    /// Uncompressed length of the cleartext, when declared
    pub original_length: Option<u64>,
}

impl ManifestEntry {
    /// Whether the cleartext was deflated before encryption
    pub fn is_deflated(&self) -> bool {
        self.compression_method == Some(DEFLATE_COMPRESSION_METHOD)
    }
}

/// Check the archive layout rules shared by both container forms
///
/// The archive must open, must not be empty, and its first entry must be
/// the media-type declaration stored without compression.
pub(crate) fn validate_layout(bytes: &[u8]) -> Result<(), RepairError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    if archive.is_empty() {
        return Err(RepairError::corrupt("archive has no entries"));
    }
    let first = archive.by_index(0)?;
    if first.name() != MIMETYPE_PATH {
        return Err(RepairError::corrupt(format!(
            "first entry is '{}', expected '{MIMETYPE_PATH}'",
            first.name()
        )));
    }
    if first.compression() != zip::CompressionMethod::Stored {
        return Err(RepairError::corrupt(
            "media-type entry must be stored without compression",
        ));
    }
    Ok(())
}

pub(crate) fn zip_entry_names(bytes: &[u8]) -> Result<Vec<String>, RepairError> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

pub(crate) fn zip_read_entry_opt(bytes: &[u8], name: &str) -> Result<Option<Vec<u8>>, RepairError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            Ok(Some(data))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(RepairError::Zip(e)),
    }
}

/// Parse an encryption manifest document
///
/// The manifest follows the XML-ENC shape: one EncryptedData element per
/// enciphered member, holding an EncryptionMethod, a CipherReference whose
/// URI names the member, and optionally a Compression element describing
/// pre-encryption deflation.
pub(crate) fn parse_manifest(xml: &str) -> Result<EncryptionManifest, RepairError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);
    let mut entries = Vec::new();

    let mut in_entry = false;
    let mut algorithm: Option<String> = None;
    let mut uri: Option<String> = None;
    let mut compression_method: Option<u8> = None;
    let mut original_length: Option<u64> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match local_name(&name) {
                    "EncryptedData" => {
                        in_entry = true;
                        algorithm = None;
                        uri = None;
                        compression_method = None;
                        original_length = None;
                    }
                    local if in_entry => {
                        read_manifest_attrs(
                            e,
                            local,
                            &mut algorithm,
                            &mut uri,
                            &mut compression_method,
                            &mut original_length,
                        )?;
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match local_name(&name) {
                    "EncryptedData" => {
                        return Err(RepairError::corrupt(
                            "manifest entry is missing its CipherReference URI",
                        ));
                    }
                    local if in_entry => {
                        read_manifest_attrs(
                            e,
                            local,
                            &mut algorithm,
                            &mut uri,
                            &mut compression_method,
                            &mut original_length,
                        )?;
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local_name(&name) == "EncryptedData" {
                    let raw_uri = uri.take().ok_or_else(|| {
                        RepairError::corrupt("manifest entry is missing its CipherReference URI")
                    })?;
                    let decoded = urlencoding::decode(&raw_uri).map_err(|e| {
                        RepairError::corrupt(format!(
                            "CipherReference URI '{raw_uri}' is not valid percent-encoding: {e}"
                        ))
                    })?;
                    let path = decoded.trim_start_matches('/').to_string();
                    if path.is_empty() {
                        return Err(RepairError::corrupt(
                            "manifest entry has an empty CipherReference URI",
                        ));
                    }
                    let algorithm = algorithm.take().ok_or_else(|| {
                        RepairError::corrupt(format!(
                            "manifest entry for '{path}' is missing its EncryptionMethod"
                        ))
                    })?;
                    entries.push(ManifestEntry {
                        path,
                        algorithm,
                        compression_method: compression_method.take(),
                        original_length: original_length.take(),
                    });
                    in_entry = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(RepairError::corrupt(format!(
                    "malformed encryption manifest at position {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(EncryptionManifest { entries })
}

fn read_manifest_attrs(
    e: &BytesStart<'_>,
    local: &str,
    algorithm: &mut Option<String>,
    uri: &mut Option<String>,
    compression_method: &mut Option<u8>,
    original_length: &mut Option<u64>,
) -> Result<(), RepairError> {
    for attr in e.attributes() {
        let attr =
            attr.map_err(|e| RepairError::corrupt(format!("bad manifest attribute: {e}")))?;
        let attr_name = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match (local, attr_name.as_str()) {
            ("EncryptionMethod", "Algorithm") => *algorithm = Some(value),
            ("CipherReference", "URI") => *uri = Some(value),
            ("Compression", "Method") => {
                *compression_method = Some(value.parse().map_err(|_| {
                    RepairError::corrupt(format!("compression method '{value}' is not a number"))
                })?);
            }
            ("Compression", "OriginalLength") => {
                *original_length = Some(value.parse().map_err(|_| {
                    RepairError::corrupt(format!("original length '{value}' is not a number"))
                })?);
            }
            _ => {}
        }
    }
    Ok(())
}
