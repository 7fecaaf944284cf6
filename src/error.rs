//! Error types for license liberation
//!
//! Every pipeline component has its own error enum so callers can match on
//! exactly the failures that component can produce, and the umbrella [`Error`]
//! wraps all of them for APIs that cross component boundaries. All errors
//! include stable bracketed codes; the same codes key the recovery-pivot
//! table consulted when a run fails.
//!
//! # Error Codes
//!
//! Error codes follow the pattern: `U<category><number>`
//!
//! Categories:
//! - **U1xxx**: License descriptor parsing
//! - **U2xxx**: Fulfillment handshake and download
//! - **U3xxx**: Rights records
//! - **U4xxx**: Device key re-encoding
//! - **U5xxx**: Container opening and repair
//! - **U6xxx**: Content decryption
//! - **U7xxx**: Run and key persistence
//!
//! ## Common Error Codes
//!
//! - `U1001`: Malformed license descriptor
//! - `U1003`: License expired
//! - `U2001`: Network error (the only retryable fulfillment failure)
//! - `U2002`: Device credentials rejected
//! - `U3001`: Unsupported rights schema version
//! - `U4002`: Device key algorithm is not RSA
//! - `U5001`: Container archive corrupt
//! - `U6002`: Device key cannot unwrap the content key
//! - `U6003`: Corrupt ciphertext in a content entry

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using the umbrella error type
pub type Result<T> = std::result::Result<T, Error>;

// ── License descriptor parsing ──────────────────────────────────────────────

/// Errors from parsing a vendor license descriptor
#[derive(Error, Debug)]
pub enum ParseError {
    /// The descriptor is not well-formed XML or a field value does not parse
    ///
    /// **Error Code**: U1001
    ///
    /// **Common Causes**:
    /// - Truncated download of the descriptor file
    /// - A descriptor produced by an unknown vendor tool revision
    #[error("[U1001] malformed license descriptor: {0}")]
    MalformedXml(String),

    /// A required field is absent or empty
    ///
    /// **Error Code**: U1002
    #[error("[U1002] license descriptor is missing required field '{0}'")]
    MissingField(String),

    /// The descriptor carries an expiry timestamp at or before the current time
    ///
    /// **Error Code**: U1003
    #[error("[U1003] license expired at {0}")]
    Expired(DateTime<Utc>),
}

impl ParseError {
    /// Create a MalformedXml error with context
    pub fn malformed(detail: impl Into<String>) -> Self {
        ParseError::MalformedXml(detail.into())
    }

    /// Create a MissingField error for the named field
    pub fn missing_field(field: impl Into<String>) -> Self {
        ParseError::MissingField(field.into())
    }

    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::MalformedXml(_) => "U1001",
            ParseError::MissingField(_) => "U1002",
            ParseError::Expired(_) => "U1003",
        }
    }
}

impl From<quick_xml::Error> for ParseError {
    fn from(err: quick_xml::Error) -> Self {
        ParseError::MalformedXml(err.to_string())
    }
}

// ── Fulfillment handshake ───────────────────────────────────────────────────

/// Errors from the fulfillment handshake and content download
#[derive(Error, Debug)]
pub enum FulfillError {
    /// Transport-level failure: connection refused, DNS, timeout
    ///
    /// **Error Code**: U2001
    ///
    /// This is the only retryable fulfillment failure. The pipeline retries
    /// it with exponential backoff up to the configured attempt limit.
    #[error("[U2001] network error during fulfillment: {0}")]
    NetworkError(String),

    /// The server refused the device credentials
    ///
    /// **Error Code**: U2002
    #[error("[U2002] fulfillment server rejected device credentials: {0}")]
    InvalidCredentials(String),

    /// The server answered with a protocol-level error
    ///
    /// **Error Code**: U2003
    #[error("[U2003] fulfillment server rejected the request (code {code}): {message}")]
    ServerRejected {
        /// Vendor error code from the response, or a synthetic `http-NNN` /
        /// `malformed-response` code when the server never produced one
        code: String,
        /// Human-readable message accompanying the rejection
        message: String,
    },
}

impl FulfillError {
    /// Create a ServerRejected error for a response body that could not be understood
    pub fn malformed_response(detail: impl Into<String>) -> Self {
        FulfillError::ServerRejected {
            code: "malformed-response".to_string(),
            message: detail.into(),
        }
    }

    /// Create a ServerRejected error from a bare HTTP status
    pub fn http_status(status: u16) -> Self {
        FulfillError::ServerRejected {
            code: format!("http-{status}"),
            message: format!("server answered with HTTP {status} and no protocol error body"),
        }
    }

    /// Whether the pipeline may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, FulfillError::NetworkError(_))
    }

    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            FulfillError::NetworkError(_) => "U2001",
            FulfillError::InvalidCredentials(_) => "U2002",
            FulfillError::ServerRejected { .. } => "U2003",
        }
    }
}

// ── Rights records ──────────────────────────────────────────────────────────

/// Errors from building or reading a rights record
#[derive(Error, Debug)]
pub enum RightsError {
    /// The schema version marker names a revision this library does not know
    ///
    /// **Error Code**: U3001
    ///
    /// **Suggestions**:
    /// - Check whether the vendor has rolled out a new protocol revision
    #[error("[U3001] unsupported rights schema version '{0}'")]
    UnsupportedSchemaVersion(String),

    /// A rights record read back from a container did not parse
    ///
    /// **Error Code**: U3002
    #[error("[U3002] malformed rights record: {0}")]
    MalformedRecord(String),
}

impl RightsError {
    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            RightsError::UnsupportedSchemaVersion(_) => "U3001",
            RightsError::MalformedRecord(_) => "U3002",
        }
    }
}

// ── Device key re-encoding ──────────────────────────────────────────────────

/// Errors from re-encoding a wrapped device key to its raw RSA form
#[derive(Error, Debug)]
pub enum KeyCodecError {
    /// The input does not start with a DER SEQUENCE or violates DER framing
    ///
    /// **Error Code**: U4001
    #[error("[U4001] device key is not an ASN.1 DER structure: {0}")]
    NotAsn1(String),

    /// The wrapping names an algorithm other than RSA
    ///
    /// **Error Code**: U4002
    #[error("[U4002] device key algorithm is not RSA: {0}")]
    UnexpectedAlgorithm(String),

    /// A length field points past the end of the buffer
    ///
    /// **Error Code**: U4003
    #[error("[U4003] device key DER structure is truncated: {0}")]
    TruncatedStructure(String),
}

impl KeyCodecError {
    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            KeyCodecError::NotAsn1(_) => "U4001",
            KeyCodecError::UnexpectedAlgorithm(_) => "U4002",
            KeyCodecError::TruncatedStructure(_) => "U4003",
        }
    }
}

// ── Container opening and repair ────────────────────────────────────────────

/// Errors from opening or repairing an encrypted container
#[derive(Error, Debug)]
pub enum RepairError {
    /// The archive opened but violates the container layout rules
    ///
    /// **Error Code**: U5001
    ///
    /// **Common Causes**:
    /// - The first entry is not the uncompressed media-type declaration
    /// - A rights record is already present with conflicting content
    /// - The encryption manifest does not parse
    #[error("[U5001] container archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    /// The ZIP layer rejected the archive
    ///
    /// **Error Code**: U5002
    #[error("[U5002] ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Reading or writing the archive failed at the I/O layer
    ///
    /// **Error Code**: U5003
    #[error("[U5003] I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepairError {
    /// Create an ArchiveCorrupt error with context
    pub fn corrupt(detail: impl Into<String>) -> Self {
        RepairError::ArchiveCorrupt(detail.into())
    }

    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            RepairError::ArchiveCorrupt(_) => "U5001",
            RepairError::Zip(_) => "U5002",
            RepairError::Io(_) => "U5003",
        }
    }
}

// ── Content decryption ──────────────────────────────────────────────────────

/// Errors from decrypting container content
#[derive(Error, Debug)]
pub enum DecryptError {
    /// The container carries no rights record
    ///
    /// **Error Code**: U6001
    ///
    /// Repair must run before decryption; hitting this from the pipeline
    /// indicates a stage-ordering bug rather than bad input.
    #[error("[U6001] container has no rights record; repair must run before decryption")]
    MissingRightsRecord,

    /// The device key does not unwrap the content key
    ///
    /// **Error Code**: U6002
    #[error("[U6002] device key cannot unwrap the content key: {0}")]
    KeyMismatch(String),

    /// A content entry failed block-cipher or padding validation
    ///
    /// **Error Code**: U6003
    ///
    /// Retried once by the pipeline in case the download was damaged in
    /// transit; a second failure is terminal.
    #[error("[U6003] corrupt ciphertext in entry '{entry}': {detail}")]
    CorruptCiphertext {
        /// Archive path of the entry that failed
        entry: String,
        /// What went wrong while decrypting it
        detail: String,
    },

    /// The container itself is unreadable
    #[error(transparent)]
    Container(#[from] RepairError),

    /// The rights record inside the container is unusable
    #[error(transparent)]
    Rights(#[from] RightsError),
}

impl DecryptError {
    /// Create a CorruptCiphertext error for the named archive entry
    pub fn corrupt_entry(entry: impl Into<String>, detail: impl Into<String>) -> Self {
        DecryptError::CorruptCiphertext {
            entry: entry.into(),
            detail: detail.into(),
        }
    }

    /// Whether the pipeline may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecryptError::CorruptCiphertext { .. })
    }

    /// Stable error code for this variant
    ///
    /// Wrapped container and rights errors keep their own codes so a failure
    /// report always names the most specific cause.
    pub fn code(&self) -> &'static str {
        match self {
            DecryptError::MissingRightsRecord => "U6001",
            DecryptError::KeyMismatch(_) => "U6002",
            DecryptError::CorruptCiphertext { .. } => "U6003",
            DecryptError::Container(e) => e.code(),
            DecryptError::Rights(e) => e.code(),
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────────────

/// Errors from the run store and the device key store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem-level failure underneath a store
    ///
    /// **Error Code**: U7001
    #[error("[U7001] store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A run record did not serialize or deserialize
    ///
    /// **Error Code**: U7002
    #[error("[U7002] run record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The embedded database reported a failure
    ///
    /// **Error Code**: U7003
    #[cfg(feature = "sled-store")]
    #[error("[U7003] sled database error: {0}")]
    Sled(#[from] sled::Error),

    /// No run record exists under the requested id
    ///
    /// **Error Code**: U7004
    #[error("[U7004] no pipeline run with id {0}")]
    RunNotFound(Uuid),

    /// No key is registered for the requested device
    ///
    /// **Error Code**: U7005
    #[error("[U7005] no device key registered for device '{0}'")]
    DeviceKeyNotFound(String),

    /// A persisted run lacks an artifact the resumed stage needs
    ///
    /// **Error Code**: U7006
    #[error("[U7006] run record is missing artifact '{0}' needed to resume")]
    MissingArtifact(String),

    /// The store backend failed in a backend-specific way
    ///
    /// **Error Code**: U7007
    #[error("[U7007] store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a MissingArtifact error for the named artifact
    pub fn missing_artifact(name: impl Into<String>) -> Self {
        StoreError::MissingArtifact(name.into())
    }

    /// Stable error code for this variant
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "U7001",
            StoreError::Serialize(_) => "U7002",
            #[cfg(feature = "sled-store")]
            StoreError::Sled(_) => "U7003",
            StoreError::RunNotFound(_) => "U7004",
            StoreError::DeviceKeyNotFound(_) => "U7005",
            StoreError::MissingArtifact(_) => "U7006",
            StoreError::Backend(_) => "U7007",
        }
    }
}

// ── Primitive layer ─────────────────────────────────────────────────────────

/// Errors from the low-level cipher primitives
///
/// These never reach callers directly; the container and fulfillment layers
/// fold them into [`DecryptError`] or [`FulfillError`] with call-site context,
/// so the variants carry no bracketed codes of their own.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Ciphertext length is not a whole number of cipher blocks
    #[error("ciphertext length is not a multiple of the cipher block size")]
    NotBlockAligned,

    /// The trailing padding bytes are inconsistent
    #[error("invalid PKCS#7 padding")]
    InvalidPadding,

    /// The initialization vector has the wrong length
    #[error("initialization vector must be {0} bytes")]
    InvalidIv(usize),

    /// The RSA backend rejected the key bytes
    #[error("RSA backend rejected the device key: {0}")]
    KeyParse(String),

    /// RSA unwrap of the content key failed
    #[error("RSA unwrap failed: {0}")]
    RsaUnwrap(String),

    /// Signing the fulfillment request failed
    #[error("request signing failed: {0}")]
    Sign(String),
}

// ── Umbrella ────────────────────────────────────────────────────────────────

/// Umbrella error type wrapping every component error
#[derive(Error, Debug)]
pub enum Error {
    /// License descriptor parsing failed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The fulfillment handshake failed
    #[error(transparent)]
    Fulfill(#[from] FulfillError),

    /// Rights record handling failed
    #[error(transparent)]
    Rights(#[from] RightsError),

    /// Device key re-encoding failed
    #[error(transparent)]
    KeyCodec(#[from] KeyCodecError),

    /// Container repair failed
    #[error(transparent)]
    Repair(#[from] RepairError),

    /// Content decryption failed
    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Stable error code of the underlying component error
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(e) => e.code(),
            Error::Fulfill(e) => e.code(),
            Error::Rights(e) => e.code(),
            Error::KeyCodec(e) => e.code(),
            Error::Repair(e) => e.code(),
            Error::Decrypt(e) => e.code(),
            Error::Store(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display_carries_code() {
        let err = ParseError::missing_field("fulfillmentUrl");
        assert!(err.to_string().contains("[U1002]"));
        assert!(err.to_string().contains("fulfillmentUrl"));
        assert_eq!(err.code(), "U1002");
    }

    #[test]
    fn test_fulfill_error_retryability() {
        assert!(FulfillError::NetworkError("timed out".to_string()).is_retryable());
        assert!(!FulfillError::InvalidCredentials("bad signature".to_string()).is_retryable());
        let rejected = FulfillError::ServerRejected {
            code: "E_UNKNOWN".to_string(),
            message: "nope".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("E_UNKNOWN"));
    }

    #[test]
    fn test_malformed_response_helper() {
        let err = FulfillError::malformed_response("missing licenseToken element");
        match &err {
            FulfillError::ServerRejected { code, message } => {
                assert_eq!(code, "malformed-response");
                assert!(message.contains("licenseToken"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(err.code(), "U2003");
    }

    #[test]
    fn test_http_status_helper() {
        let err = FulfillError::http_status(502);
        assert!(err.to_string().contains("http-502"));
    }

    #[test]
    fn test_decrypt_error_delegates_inner_codes() {
        let container = DecryptError::Container(RepairError::corrupt("bad first entry"));
        assert_eq!(container.code(), "U5001");
        let rights =
            DecryptError::Rights(RightsError::UnsupportedSchemaVersion("urn:x:9".to_string()));
        assert_eq!(rights.code(), "U3001");
    }

    #[test]
    fn test_corrupt_ciphertext_retryable_and_named() {
        let err = DecryptError::corrupt_entry("OEBPS/ch1.xhtml", "invalid PKCS#7 padding");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[U6003]"));
        assert!(err.to_string().contains("OEBPS/ch1.xhtml"));
        assert!(!DecryptError::MissingRightsRecord.is_retryable());
    }

    #[test]
    fn test_umbrella_error_code_passthrough() {
        let err: Error = KeyCodecError::UnexpectedAlgorithm("1.2.840.10045.2.1".to_string()).into();
        assert_eq!(err.code(), "U4002");
        assert!(err.to_string().contains("[U4002]"));
    }

    #[test]
    fn test_store_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StoreError::from(io);
        assert_eq!(err.code(), "U7001");
        assert!(err.to_string().contains("[U7001]"));
    }
}
