//! Fulfillment handshake
//!
//! One signed XML request to the vendor endpoint named by the descriptor,
//! answered either by a fulfillment response (license token, wrapped content
//! key, download location, schema version marker) or by a protocol error
//! document. The [`FulfillmentClient`] trait keeps the orchestrator unaware
//! of the transport so tests and alternate vendor adapters can stand in for
//! the HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, instrument};
use url::Url;

use crate::crypto;
use crate::device::DeviceCredentials;
use crate::error::FulfillError;
use crate::keycodec;
use crate::model::{FulfillmentResponse, LICENSE_NAMESPACE, LicenseDescriptor};
use crate::xml::{XML_BUFFER_CAPACITY, local_name};

/// User agent presented to fulfillment servers
const USER_AGENT: &str = concat!("unseal/", env!("CARGO_PKG_VERSION"));

/// Default timeout for handshake and download requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor error code that maps to rejected credentials
const AUTH_ERROR_CODE: &str = "E_AUTH";

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Transport adapter for the fulfillment handshake and content download
///
/// Implementations must be shareable across worker tasks.
#[async_trait]
pub trait FulfillmentClient: Send + Sync {
    /// Perform the signed handshake against the descriptor's endpoint
    async fn fulfill(
        &self,
        descriptor: &LicenseDescriptor,
        credentials: &DeviceCredentials,
    ) -> Result<FulfillmentResponse, FulfillError>;

    /// Fetch the encrypted container from the fulfillment response's URL
    async fn download(&self, url: &Url) -> Result<Vec<u8>, FulfillError>;
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// Canonical byte layout of the signed request fields
///
/// The server reconstructs this exact string to verify the signature, so
/// the field order and separator are part of the protocol.
pub fn signing_payload(device_id: &str, resource_id: &str, identifier: &str) -> String {
    format!("{device_id}\n{resource_id}\n{identifier}")
}

/// Build the signed fulfillment request document
///
/// Fails only when the device key cannot be used to sign, which the
/// pipeline treats as a credentials problem.
pub fn build_request(
    descriptor: &LicenseDescriptor,
    credentials: &DeviceCredentials,
) -> Result<String, FulfillError> {
    let raw_key = keycodec::ensure_raw(&credentials.key)
        .map_err(|e| FulfillError::InvalidCredentials(format!("device key is unusable: {e}")))?;
    let key = crypto::rsa::load_private_key(&raw_key)
        .map_err(|e| FulfillError::InvalidCredentials(format!("device key is unusable: {e}")))?;

    let payload = signing_payload(
        &credentials.device_id,
        &descriptor.resource_id,
        &descriptor.identifier,
    );
    let signature = crypto::rsa::sign_request(&key, payload.as_bytes())
        .map_err(|e| FulfillError::InvalidCredentials(e.to_string()))?;

    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <fulfillmentRequest xmlns=\"{}\">\n\
         \x20 <device>{}</device>\n\
         \x20 <resource>{}</resource>\n\
         \x20 <identifier>{}</identifier>\n\
         \x20 <signature>{}</signature>\n\
         </fulfillmentRequest>\n",
        LICENSE_NAMESPACE,
        escape(&credentials.device_id),
        escape(&descriptor.resource_id),
        escape(&descriptor.identifier),
        BASE64.encode(&signature),
    ))
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse a fulfillment response body
///
/// Protocol error documents come back as typed errors: `E_AUTH` becomes
/// [`FulfillError::InvalidCredentials`], everything else keeps its vendor
/// code in [`FulfillError::ServerRejected`]. A body that fits neither shape
/// is reported with the synthetic code `malformed-response`. The raw body is
/// retained verbatim on the parsed response.
pub fn parse_response(body: &str) -> Result<FulfillmentResponse, FulfillError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);
    let mut text_buffer = String::new();

    let mut saw_response = false;
    let mut version: Option<u32> = None;
    let mut license_token: Option<String> = None;
    let mut encrypted_key: Option<String> = None;
    let mut download_url: Option<String> = None;

    let mut saw_error = false;
    let mut error_code: Option<String> = None;
    let mut error_message = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match local_name(&name) {
                    "fulfillmentResponse" => {
                        saw_response = true;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                FulfillError::malformed_response(format!("bad attribute: {e}"))
                            })?;
                            if attr.key.as_ref() == b"version" {
                                let raw = String::from_utf8_lossy(&attr.value).to_string();
                                version = Some(raw.parse().map_err(|_| {
                                    FulfillError::malformed_response(format!(
                                        "version marker '{raw}' is not a number"
                                    ))
                                })?);
                            }
                        }
                    }
                    "fulfillmentError" => {
                        saw_error = true;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                FulfillError::malformed_response(format!("bad attribute: {e}"))
                            })?;
                            if attr.key.as_ref() == b"code" {
                                error_code =
                                    Some(String::from_utf8_lossy(&attr.value).to_string());
                            }
                        }
                    }
                    _ => {}
                }
                text_buffer.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| {
                    FulfillError::malformed_response(format!("bad character data: {e}"))
                })?;
                text_buffer.push_str(&text);
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let value = text_buffer.trim().to_string();
                match local_name(&name) {
                    "licenseToken" => license_token = Some(value),
                    "encryptedKey" => encrypted_key = Some(value),
                    "downloadUrl" => download_url = Some(value),
                    "fulfillmentError" => error_message = value,
                    _ => {}
                }
                text_buffer.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FulfillError::malformed_response(format!(
                    "XML error at position {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if saw_error {
        let code = error_code.unwrap_or_else(|| "unspecified".to_string());
        if code == AUTH_ERROR_CODE {
            let message = if error_message.is_empty() {
                format!("server reported {AUTH_ERROR_CODE}")
            } else {
                error_message
            };
            return Err(FulfillError::InvalidCredentials(message));
        }
        return Err(FulfillError::ServerRejected {
            code,
            message: error_message,
        });
    }

    if !saw_response {
        return Err(FulfillError::malformed_response(
            "no fulfillmentResponse element found",
        ));
    }

    let license_token = match license_token {
        Some(token) if !token.is_empty() => token,
        _ => {
            return Err(FulfillError::malformed_response(
                "missing licenseToken element",
            ));
        }
    };

    let encrypted_key = encrypted_key
        .ok_or_else(|| FulfillError::malformed_response("missing encryptedKey element"))?;
    let encrypted_content_key = BASE64.decode(encrypted_key.as_bytes()).map_err(|e| {
        FulfillError::malformed_response(format!("encryptedKey is not valid base64: {e}"))
    })?;
    if encrypted_content_key.is_empty() {
        return Err(FulfillError::malformed_response(
            "encryptedKey element is empty",
        ));
    }

    let raw_url = download_url
        .ok_or_else(|| FulfillError::malformed_response("missing downloadUrl element"))?;
    let download_url = Url::parse(&raw_url).map_err(|e| {
        FulfillError::malformed_response(format!("invalid download URL '{raw_url}': {e}"))
    })?;

    Ok(FulfillmentResponse {
        license_token,
        encrypted_content_key,
        download_url,
        // servers predating the marker omit it; the first revision applies
        schema_version: version.unwrap_or(1),
        raw_payload: body.to_string(),
    })
}

/// Extract an explicit protocol error document from a non-2xx body
///
/// Returns None when the body is not a protocol error, so HTTP-level causes
/// keep their own `http-NNN` codes.
fn parse_error_body(body: &str) -> Option<FulfillError> {
    match parse_response(body) {
        Err(err @ FulfillError::InvalidCredentials(_)) => Some(err),
        Err(FulfillError::ServerRejected { code, message }) if code != "malformed-response" => {
            Some(FulfillError::ServerRejected { code, message })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// [`FulfillmentClient`] over HTTPS
pub struct HttpFulfillmentClient {
    http: reqwest::Client,
}

impl HttpFulfillmentClient {
    /// Create a client with the default 30 second request timeout
    pub fn new() -> Result<Self, FulfillError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, FulfillError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| FulfillError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpFulfillmentClient { http })
    }
}

#[async_trait]
impl FulfillmentClient for HttpFulfillmentClient {
    #[instrument(skip_all, fields(url = %descriptor.fulfillment_url, device = %credentials.device_id))]
    async fn fulfill(
        &self,
        descriptor: &LicenseDescriptor,
        credentials: &DeviceCredentials,
    ) -> Result<FulfillmentResponse, FulfillError> {
        let request_xml = build_request(descriptor, credentials)?;
        debug!(bytes = request_xml.len(), "sending fulfillment request");

        let response = self
            .http
            .post(descriptor.fulfillment_url.clone())
            .header(CONTENT_TYPE, "application/xml")
            .body(request_xml)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = match parse_error_body(&body) {
                Some(FulfillError::InvalidCredentials(message)) => message,
                _ => format!("server answered HTTP {}", status.as_u16()),
            };
            return Err(FulfillError::InvalidCredentials(message));
        }
        if !status.is_success() {
            return Err(
                parse_error_body(&body).unwrap_or_else(|| FulfillError::http_status(status.as_u16()))
            );
        }

        let parsed = parse_response(&body)?;
        info!(
            schema_version = parsed.schema_version,
            "fulfillment handshake complete"
        );
        Ok(parsed)
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn download(&self, url: &Url) -> Result<Vec<u8>, FulfillError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FulfillError::http_status(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(map_transport_error)?;
        debug!(bytes = bytes.len(), "downloaded encrypted container");
        Ok(bytes.to_vec())
    }
}

fn map_transport_error(err: reqwest::Error) -> FulfillError {
    if err.is_timeout() {
        FulfillError::NetworkError(format!("request timed out: {err}"))
    } else {
        FulfillError::NetworkError(err.to_string())
    }
}
