//! Small helpers shared by the XML readers

/// Initial capacity for XML event buffers
pub(crate) const XML_BUFFER_CAPACITY: usize = 4096;

/// Extract the local element name, dropping any namespace prefix
///
/// `"lic:licenseDescriptor"` becomes `"licenseDescriptor"`. Vendors are
/// inconsistent about prefixing, so every reader dispatches on local names.
pub(crate) fn local_name(name: &str) -> &str {
    if let Some(pos) = name.rfind(':') {
        &name[pos + 1..]
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_name_strips_prefix() {
        assert_eq!(local_name("enc:EncryptedData"), "EncryptedData");
        assert_eq!(local_name("rights"), "rights");
        assert_eq!(local_name(":odd"), "odd");
    }
}
