//! Rights-record injection
//!
//! Vendors ship containers with the rights entry stripped out. Repair writes
//! a reconstructed record to its well-known path while copying every existing
//! entry byte-exact, so entry order and compression survive untouched.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::RepairError;
use crate::rights::RightsRecord;

use super::{EncryptedContainer, RIGHTS_PATH};

/// Write the rights record into the container at [`RIGHTS_PATH`]
///
/// Re-running repair on an already-repaired container is a no-op as long as
/// the existing rights entry matches the record byte for byte. A rights entry
/// with different content means the archive belongs to some other fulfillment
/// and the call fails rather than overwrite it.
///
/// All pre-existing entries are raw-copied, so the media-type entry stays
/// first and stored, and no other entry is recompressed.
pub fn inject_rights(
    container: EncryptedContainer,
    record: &RightsRecord,
) -> Result<EncryptedContainer, RepairError> {
    let rendered = record.to_xml();

    match container.read_entry_opt(RIGHTS_PATH)? {
        Some(existing) if existing == rendered.as_bytes() => return Ok(container),
        Some(_) => {
            return Err(RepairError::corrupt(format!(
                "container already carries a conflicting '{RIGHTS_PATH}'"
            )));
        }
        None => {}
    }

    let mut archive = ZipArchive::new(Cursor::new(container.as_bytes()))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        writer.raw_copy_file(entry)?;
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(RIGHTS_PATH, options)?;
    writer.write_all(rendered.as_bytes())?;
    let bytes = writer.finish()?.into_inner();

    EncryptedContainer::from_bytes(bytes)
}
