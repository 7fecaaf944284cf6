//! Vendor license descriptor parsing
//!
//! A purchase hands the user a small XML descriptor naming the work and the
//! fulfillment endpoint. Descriptors come from many vendor tool revisions,
//! so the parser dispatches on local element names, ignores elements it does
//! not know, and treats the namespace prefix as noise.

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use url::Url;

use crate::error::ParseError;
use crate::model::LicenseDescriptor;
use crate::xml::{XML_BUFFER_CAPACITY, local_name};

/// Parse a license descriptor, checking expiry against the current time
pub fn parse(bytes: &[u8]) -> Result<LicenseDescriptor, ParseError> {
    parse_at(bytes, Utc::now())
}

/// Parse a license descriptor, checking expiry against the given instant
///
/// A descriptor whose expiry is at or before `now` is rejected with
/// [`ParseError::Expired`]; expiry exactly at `now` counts as expired.
pub fn parse_at(bytes: &[u8], now: DateTime<Utc>) -> Result<LicenseDescriptor, ParseError> {
    let xml = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);
    let mut text_buffer = String::new();

    let mut saw_root = false;
    let mut title: Option<String> = None;
    let mut authors: Vec<String> = Vec::new();
    let mut identifier: Option<String> = None;
    let mut resource_id: Option<String> = None;
    let mut fulfillment_url: Option<String> = None;
    let mut expires: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local_name(&name) == "licenseDescriptor" {
                    saw_root = true;
                }
                text_buffer.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| ParseError::malformed(format!("bad character data: {e}")))?;
                text_buffer.push_str(&text);
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let value = text_buffer.trim().to_string();
                match local_name(&name) {
                    "title" => title = Some(value),
                    "author" => {
                        if !value.is_empty() {
                            authors.push(value);
                        }
                    }
                    "identifier" => identifier = Some(value),
                    "resource" => resource_id = Some(value),
                    "fulfillmentUrl" => fulfillment_url = Some(value),
                    "expires" => expires = Some(value),
                    _ => {}
                }
                text_buffer.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ParseError::malformed(format!(
                    "XML error at position {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ParseError::malformed("no licenseDescriptor element found"));
    }

    let title = require(title, "title")?;
    let identifier = require(identifier, "identifier")?;
    let resource_id = require(resource_id, "resource")?;
    let raw_url = require(fulfillment_url, "fulfillmentUrl")?;

    let fulfillment_url = Url::parse(&raw_url).map_err(|e| {
        ParseError::malformed(format!("invalid fulfillment URL '{raw_url}': {e}"))
    })?;

    let expires_at = match expires {
        Some(raw) if !raw.is_empty() => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| {
                    ParseError::malformed(format!("invalid expiry timestamp '{raw}': {e}"))
                })?
                .with_timezone(&Utc),
        ),
        _ => None,
    };

    if let Some(at) = expires_at {
        if at <= now {
            return Err(ParseError::Expired(at));
        }
    }

    Ok(LicenseDescriptor {
        title,
        authors,
        identifier,
        resource_id,
        fulfillment_url,
        expires_at,
    })
}

fn require(value: Option<String>, field: &str) -> Result<String, ParseError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ParseError::missing_field(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor_xml() -> String {
        r#"<?xml version="1.0" encoding="UTF-8"?>
<lic:licenseDescriptor xmlns:lic="urn:publication-license:1.0">
  <lic:title>Meditations &amp; Marginalia</lic:title>
  <lic:author>M. Aurelius</lic:author>
  <lic:author>A. Translator</lic:author>
  <lic:identifier>urn:isbn:9780000000001</lic:identifier>
  <lic:resource>res-77f2</lic:resource>
  <lic:fulfillmentUrl>https://fulfill.example.com/v1/handshake</lic:fulfillmentUrl>
  <lic:expires>2031-06-01T12:00:00Z</lic:expires>
</lic:licenseDescriptor>"#
            .to_string()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_complete_descriptor() {
        let descriptor = parse_at(descriptor_xml().as_bytes(), fixed_now()).unwrap();
        assert_eq!(descriptor.title, "Meditations & Marginalia");
        assert_eq!(descriptor.authors, vec!["M. Aurelius", "A. Translator"]);
        assert_eq!(descriptor.identifier, "urn:isbn:9780000000001");
        assert_eq!(descriptor.resource_id, "res-77f2");
        assert_eq!(
            descriptor.fulfillment_url.as_str(),
            "https://fulfill.example.com/v1/handshake"
        );
        assert_eq!(
            descriptor.expires_at,
            Some(Utc.with_ymd_and_hms(2031, 6, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_unknown_elements_are_ignored() {
        let xml = r#"<licenseDescriptor>
  <title>T</title>
  <identifier>i</identifier>
  <resource>r</resource>
  <fulfillmentUrl>https://f.example.com/</fulfillmentUrl>
  <vendorCustomField>whatever</vendorCustomField>
</licenseDescriptor>"#;
        let descriptor = parse_at(xml.as_bytes(), fixed_now()).unwrap();
        assert_eq!(descriptor.title, "T");
        assert!(descriptor.authors.is_empty());
        assert_eq!(descriptor.expires_at, None);
    }

    #[test]
    fn test_missing_fulfillment_url() {
        let xml = r#"<licenseDescriptor>
  <title>T</title>
  <identifier>i</identifier>
  <resource>r</resource>
</licenseDescriptor>"#;
        let err = parse_at(xml.as_bytes(), fixed_now()).unwrap_err();
        match err {
            ParseError::MissingField(field) => assert_eq!(field, "fulfillmentUrl"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_required_field_counts_as_missing() {
        let xml = r#"<licenseDescriptor>
  <title>T</title>
  <identifier></identifier>
  <resource>r</resource>
  <fulfillmentUrl>https://f.example.com/</fulfillmentUrl>
</licenseDescriptor>"#;
        let err = parse_at(xml.as_bytes(), fixed_now()).unwrap_err();
        assert!(matches!(err, ParseError::MissingField(f) if f == "identifier"));
    }

    #[test]
    fn test_invalid_url_is_malformed() {
        let xml = r#"<licenseDescriptor>
  <title>T</title>
  <identifier>i</identifier>
  <resource>r</resource>
  <fulfillmentUrl>not a url</fulfillmentUrl>
</licenseDescriptor>"#;
        let err = parse_at(xml.as_bytes(), fixed_now()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedXml(_)));
    }

    #[test]
    fn test_invalid_expiry_timestamp_is_malformed() {
        let xml = r#"<licenseDescriptor>
  <title>T</title>
  <identifier>i</identifier>
  <resource>r</resource>
  <fulfillmentUrl>https://f.example.com/</fulfillmentUrl>
  <expires>next tuesday</expires>
</licenseDescriptor>"#;
        let err = parse_at(xml.as_bytes(), fixed_now()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedXml(_)));
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let expiry = Utc.with_ymd_and_hms(2031, 6, 1, 12, 0, 0).unwrap();

        // expiry exactly equal to now already counts as expired
        let err = parse_at(descriptor_xml().as_bytes(), expiry).unwrap_err();
        match err {
            ParseError::Expired(at) => assert_eq!(at, expiry),
            other => panic!("unexpected error: {other:?}"),
        }

        // one second earlier is still inside the window
        let just_before = expiry - chrono::Duration::seconds(1);
        assert!(parse_at(descriptor_xml().as_bytes(), just_before).is_ok());
    }

    #[test]
    fn test_expired_descriptor_with_wall_clock() {
        let xml = descriptor_xml().replace("2031-06-01T12:00:00Z", "2020-01-01T00:00:00Z");
        let err = parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::Expired(_)));
        assert_eq!(err.code(), "U1003");
    }

    #[test]
    fn test_unclosed_tag_is_malformed() {
        let xml = "<licenseDescriptor><title>T</licenseDescriptor>";
        let err = parse_at(xml.as_bytes(), fixed_now()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedXml(_)));
    }

    #[test]
    fn test_non_xml_input_is_malformed() {
        let err = parse_at(b"{\"not\": \"xml\"}", fixed_now()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedXml(_)));
    }
}
