//! Rights record construction and rendering
//!
//! A rights record is the small XML document historical reader tools expect
//! at `META-INF/rights.xml`: the license token plus the wrapped content key,
//! under a namespace that names the schema revision. Rendering is fully
//! deterministic so that injecting the same record twice is a byte-level
//! no-op, which is what makes container repair idempotent.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::RightsError;
use crate::model::{FulfillmentResponse, SchemaVersion};
use crate::xml::{XML_BUFFER_CAPACITY, local_name};

/// Reconstructed rights record ready for injection into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RightsRecord {
    /// Schema revision the record is rendered under
    pub schema_version: SchemaVersion,
    /// Opaque license token from the fulfillment response
    pub license_token: String,
    /// Content key, still RSA-wrapped to the device key
    pub encrypted_content_key: Vec<u8>,
}

/// Build a rights record from a fulfillment response
///
/// The only failure is a version marker naming a schema revision this
/// library does not know.
pub fn build(response: &FulfillmentResponse) -> Result<RightsRecord, RightsError> {
    let schema_version = SchemaVersion::from_marker(response.schema_version)
        .ok_or_else(|| RightsError::UnsupportedSchemaVersion(response.schema_version.to_string()))?;
    Ok(RightsRecord {
        schema_version,
        license_token: response.license_token.clone(),
        encrypted_content_key: response.encrypted_content_key.clone(),
    })
}

impl RightsRecord {
    /// Render the record as the XML document stored in the container
    ///
    /// Byte-for-byte deterministic for a given record.
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <rights xmlns=\"{}\">\n\
             \x20 <licenseToken>{}</licenseToken>\n\
             \x20 <encryptedKey>{}</encryptedKey>\n\
             </rights>\n",
            self.schema_version.rights_namespace(),
            escape(&self.license_token),
            BASE64.encode(&self.encrypted_content_key),
        )
    }

    /// Parse a rights record read back out of a container
    pub fn parse(xml: &str) -> Result<RightsRecord, RightsError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);
        let mut text_buffer = String::new();

        let mut namespace: Option<String> = None;
        let mut license_token: Option<String> = None;
        let mut encrypted_key: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if local_name(&name) == "rights" {
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                RightsError::MalformedRecord(format!("bad attribute: {e}"))
                            })?;
                            let attr_name = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            if attr_name == "xmlns" || attr_name.starts_with("xmlns:") {
                                namespace =
                                    Some(String::from_utf8_lossy(&attr.value).to_string());
                            }
                        }
                    }
                    text_buffer.clear();
                }
                Ok(Event::Text(ref e)) => {
                    let text = e.unescape().map_err(|e| {
                        RightsError::MalformedRecord(format!("bad character data: {e}"))
                    })?;
                    text_buffer.push_str(&text);
                }
                Ok(Event::End(ref e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let value = text_buffer.trim().to_string();
                    match local_name(&name) {
                        "licenseToken" => license_token = Some(value),
                        "encryptedKey" => encrypted_key = Some(value),
                        _ => {}
                    }
                    text_buffer.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(RightsError::MalformedRecord(format!(
                        "XML error at position {}: {e}",
                        reader.buffer_position()
                    )));
                }
                _ => {}
            }
            buf.clear();
        }

        let namespace = namespace
            .ok_or_else(|| RightsError::MalformedRecord("no rights element found".to_string()))?;
        let schema_version = SchemaVersion::from_namespace(&namespace)
            .ok_or(RightsError::UnsupportedSchemaVersion(namespace))?;

        let license_token = match license_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Err(RightsError::MalformedRecord(
                    "missing licenseToken element".to_string(),
                ));
            }
        };

        let encrypted_key = encrypted_key.ok_or_else(|| {
            RightsError::MalformedRecord("missing encryptedKey element".to_string())
        })?;
        let encrypted_content_key = BASE64.decode(encrypted_key.as_bytes()).map_err(|e| {
            RightsError::MalformedRecord(format!("encryptedKey is not valid base64: {e}"))
        })?;
        if encrypted_content_key.is_empty() {
            return Err(RightsError::MalformedRecord(
                "encryptedKey element is empty".to_string(),
            ));
        }

        Ok(RightsRecord {
            schema_version,
            license_token,
            encrypted_content_key,
        })
    }
}
