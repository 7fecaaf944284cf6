//! Data structures shared across the liberation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Namespace of vendor license descriptors and fulfillment messages
pub const LICENSE_NAMESPACE: &str = "urn:publication-license:1.0";

/// Length in bytes of an unwrapped content key (AES-128)
pub const CONTENT_KEY_LEN: usize = 16;

/// Rights schema revision
///
/// The fulfillment response carries a numeric version marker; each known
/// marker maps to a rights-record namespace and a default content scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// First protocol revision
    V1,
    /// Second protocol revision, which moved key wrapping to OAEP
    V2,
}

impl SchemaVersion {
    /// Map a numeric version marker to a schema revision
    pub fn from_marker(marker: u32) -> Option<Self> {
        match marker {
            1 => Some(SchemaVersion::V1),
            2 => Some(SchemaVersion::V2),
            _ => None,
        }
    }

    /// Numeric marker used on the wire for this revision
    pub fn marker(&self) -> u32 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }

    /// Namespace URI written into rights records of this revision
    pub fn rights_namespace(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "urn:publication-rights:1.0",
            SchemaVersion::V2 => "urn:publication-rights:2.0",
        }
    }

    /// Map a rights-record namespace URI back to its revision
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        match namespace {
            "urn:publication-rights:1.0" => Some(SchemaVersion::V1),
            "urn:publication-rights:2.0" => Some(SchemaVersion::V2),
            _ => None,
        }
    }

    /// Content scheme this revision uses unless overridden by configuration
    pub fn default_scheme(&self) -> ContentScheme {
        match self {
            SchemaVersion::V1 => ContentScheme {
                key_wrap: KeyWrap::Pkcs1v15,
                iv: IvConvention::CiphertextPrefix(16),
            },
            SchemaVersion::V2 => ContentScheme {
                key_wrap: KeyWrap::OaepSha1,
                iv: IvConvention::CiphertextPrefix(16),
            },
        }
    }
}

/// RSA padding used to wrap the content key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyWrap {
    /// PKCS#1 v1.5 padding
    Pkcs1v15,
    /// OAEP with SHA-1 digests
    OaepSha1,
}

/// Where each content entry keeps its initialization vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IvConvention {
    /// The first N bytes of the stored entry are the IV; the rest is ciphertext
    CiphertextPrefix(usize),
}

impl IvConvention {
    /// Split a stored entry into its IV and ciphertext parts
    ///
    /// Returns None when the entry is too short to hold an IV and at least
    /// one cipher block.
    pub fn split<'a>(&self, data: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        match self {
            IvConvention::CiphertextPrefix(len) => {
                if data.len() <= *len {
                    None
                } else {
                    Some(data.split_at(*len))
                }
            }
        }
    }
}

/// How content entries of one schema revision are enciphered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScheme {
    /// RSA padding wrapping the content key
    pub key_wrap: KeyWrap,
    /// IV placement convention for content entries
    pub iv: IvConvention,
}

/// Parsed vendor license descriptor
///
/// The small XML file a purchase hands to the user. It identifies the work
/// and tells the pipeline where to perform the fulfillment handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseDescriptor {
    /// Title of the licensed work
    pub title: String,
    /// Authors in document order; may be empty
    pub authors: Vec<String>,
    /// Vendor identifier of the work, typically an ISBN or catalog id
    pub identifier: String,
    /// Vendor resource id naming the concrete content build
    pub resource_id: String,
    /// Endpoint for the fulfillment handshake
    pub fulfillment_url: Url,
    /// Expiry of the descriptor itself, if the vendor set one
    pub expires_at: Option<DateTime<Utc>>,
}

/// Successful fulfillment handshake result
///
/// Retained in full on the run record, including the raw response body, so
/// failed runs can be diagnosed and resumed without repeating the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentResponse {
    /// Opaque license token to embed in the rights record
    pub license_token: String,
    /// Content key, RSA-wrapped to the device key
    pub encrypted_content_key: Vec<u8>,
    /// Where to download the encrypted container
    pub download_url: Url,
    /// Numeric rights schema version marker announced by the server
    pub schema_version: u32,
    /// Raw response body exactly as received
    pub raw_payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_marker_round_trip() {
        assert_eq!(SchemaVersion::from_marker(1), Some(SchemaVersion::V1));
        assert_eq!(SchemaVersion::from_marker(2), Some(SchemaVersion::V2));
        assert_eq!(SchemaVersion::from_marker(3), None);
        assert_eq!(SchemaVersion::V1.marker(), 1);
        assert_eq!(SchemaVersion::V2.marker(), 2);
    }

    #[test]
    fn test_schema_version_namespace_mapping() {
        assert_eq!(
            SchemaVersion::from_namespace(SchemaVersion::V1.rights_namespace()),
            Some(SchemaVersion::V1)
        );
        assert_eq!(
            SchemaVersion::from_namespace(SchemaVersion::V2.rights_namespace()),
            Some(SchemaVersion::V2)
        );
        assert_eq!(SchemaVersion::from_namespace("urn:other:1.0"), None);
    }

    #[test]
    fn test_default_schemes_differ_by_key_wrap() {
        assert_eq!(
            SchemaVersion::V1.default_scheme().key_wrap,
            KeyWrap::Pkcs1v15
        );
        assert_eq!(
            SchemaVersion::V2.default_scheme().key_wrap,
            KeyWrap::OaepSha1
        );
        assert_eq!(
            SchemaVersion::V1.default_scheme().iv,
            IvConvention::CiphertextPrefix(16)
        );
    }

    #[test]
    fn test_iv_split() {
        let data: Vec<u8> = (0..48).collect();
        let (iv, ct) = IvConvention::CiphertextPrefix(16).split(&data).unwrap();
        assert_eq!(iv, &data[..16]);
        assert_eq!(ct, &data[16..]);
        assert_eq!(ct.len(), 32);

        // an entry that is nothing but IV has no ciphertext to decrypt
        assert!(IvConvention::CiphertextPrefix(16).split(&data[..16]).is_none());
        assert!(IvConvention::CiphertextPrefix(16).split(&[]).is_none());
    }
}
