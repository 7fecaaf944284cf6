//! Shared fixtures for integration tests
//!
//! Builds vendor-style protected containers, descriptor and response
//! documents, and a scripted in-process fulfillment client, so the
//! orchestrator tests can run full pipelines without touching a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;
use url::Url;
use zip::write::SimpleFileOptions;

use unseal::crypto::aes::aes_cbc_encrypt;
use unseal::crypto::rsa::wrap_content_key;
use unseal::device::DeviceCredentials;
use unseal::error::FulfillError;
use unseal::fulfillment::{self, FulfillmentClient};
use unseal::model::KeyWrap;
use unseal::{CancelToken, FulfillmentResponse, LicenseDescriptor};

/// Route pipeline tracing to the test harness, honoring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// AES content key every fixture container is enciphered under
pub const CONTENT_KEY: [u8; 16] = *b"0123456789abcdef";

/// Fixed IV carried as the ciphertext prefix of fixture payloads
pub const IV: [u8; 16] = [0x5A; 16];

/// Cleartext of the first protected entry in the fixture container
pub const CHAPTER_ONE: &[u8] = b"<html><body><p>It was a bright cold day in April.</p></body></html>";

/// Cleartext of the second protected entry
pub const STYLE_SHEET: &[u8] = b"body { margin: 0; }";

/// RSA key backing the fixture device
///
/// Generated once per test binary; 2048-bit generation is the slow part
/// of these tests, so every fixture shares it.
pub fn device_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
}

/// A second key that was never granted this fulfillment
pub fn stranger_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
}

/// Fixture device key in raw PKCS#1 form
pub fn device_key_pkcs1() -> Vec<u8> {
    device_key().to_pkcs1_der().unwrap().as_bytes().to_vec()
}

/// The stranger's key in raw PKCS#1 form
pub fn stranger_key_pkcs1() -> Vec<u8> {
    stranger_key().to_pkcs1_der().unwrap().as_bytes().to_vec()
}

/// Fixture device key in the vendor's wrapped PKCS#8 form
pub fn device_key_pkcs8() -> Vec<u8> {
    device_key().to_pkcs8_der().unwrap().as_bytes().to_vec()
}

/// Content key wrapped to the fixture device
///
/// Wrapped once per scheme per test binary; both wrap paddings are
/// randomized, so caching is what lets fixtures agree byte for byte.
pub fn wrapped_content_key(wrap: KeyWrap) -> Vec<u8> {
    static PKCS1V15: OnceLock<Vec<u8>> = OnceLock::new();
    static OAEP_SHA1: OnceLock<Vec<u8>> = OnceLock::new();
    let cell = match wrap {
        KeyWrap::Pkcs1v15 => &PKCS1V15,
        KeyWrap::OaepSha1 => &OAEP_SHA1,
    };
    cell.get_or_init(|| {
        wrap_content_key(&device_key().to_public_key(), &CONTENT_KEY, wrap).unwrap()
    })
    .clone()
}

/// Content key wrapped to the fixture device, base64-armored for XML
pub fn wrapped_content_key_b64(wrap: KeyWrap) -> String {
    BASE64.encode(wrapped_content_key(wrap))
}

/// A well-formed license descriptor pointing at the given endpoint
pub fn descriptor_xml(fulfillment_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<lic:licenseDescriptor xmlns:lic="urn:publication-license:1.0">
  <lic:title>The Liberated Manual</lic:title>
  <lic:author>A. Nonymous</lic:author>
  <lic:identifier>urn:isbn:9780000000042</lic:identifier>
  <lic:resource>res-42</lic:resource>
  <lic:fulfillmentUrl>{fulfillment_url}</lic:fulfillmentUrl>
</lic:licenseDescriptor>"#
    )
}

/// A fulfillment response document for the given schema revision
pub fn response_xml(version: u32, wrapped_key_b64: &str, download_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<fulfillmentResponse xmlns="urn:publication-license:1.0" version="{version}">
  <licenseToken>tok-fixture</licenseToken>
  <encryptedKey>{wrapped_key_b64}</encryptedKey>
  <downloadUrl>{download_url}</downloadUrl>
</fulfillmentResponse>"#
    )
}

/// Encipher a cleartext the way vendor packaging does: IV first, then CBC
pub fn encrypt_payload(plaintext: &[u8]) -> Vec<u8> {
    let mut payload = IV.to_vec();
    payload.extend_from_slice(&aes_cbc_encrypt(&CONTENT_KEY, &IV, plaintext));
    payload
}

/// Build a vendor-shipped container: two protected entries, manifest, no rights
pub fn stripped_container() -> Vec<u8> {
    let manifest = r#"<encryption xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
    <enc:CipherData>
      <enc:CipherReference URI="OEBPS/chapter1.xhtml"/>
    </enc:CipherData>
  </enc:EncryptedData>
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
    <enc:CipherData>
      <enc:CipherReference URI="OEBPS/style.css"/>
    </enc:CipherData>
  </enc:EncryptedData>
</encryption>"#;
    build_archive(&[
        ("mimetype", b"application/epub+zip", true),
        (
            "META-INF/container.xml",
            br#"<container version="1.0"/>"#,
            false,
        ),
        ("META-INF/encryption.xml", manifest.as_bytes(), false),
        ("OEBPS/chapter1.xhtml", &encrypt_payload(CHAPTER_ONE), false),
        ("OEBPS/style.css", &encrypt_payload(STYLE_SHEET), false),
    ])
}

/// Assemble a ZIP archive from `(name, data, stored)` triples
pub fn build_archive(entries: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data, stored) in entries {
        let options = if *stored {
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
        };
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Scripted stand-in for the HTTP fulfillment client
///
/// Queued failures are consumed front to back, one per `fulfill` call;
/// once the queue is empty, `fulfill` answers with the configured response
/// document and `download` hands out the configured container bytes.
pub struct MockFulfillmentClient {
    response_xml: String,
    container: Vec<u8>,
    failures: Mutex<VecDeque<FulfillError>>,
    fulfill_calls: Arc<AtomicUsize>,
    download_calls: Arc<AtomicUsize>,
    cancel_after_fulfill: Option<CancelToken>,
}

impl MockFulfillmentClient {
    pub fn new(response_xml: String, container: Vec<u8>) -> Self {
        MockFulfillmentClient {
            response_xml,
            container,
            failures: Mutex::new(VecDeque::new()),
            fulfill_calls: Arc::new(AtomicUsize::new(0)),
            download_calls: Arc::new(AtomicUsize::new(0)),
            cancel_after_fulfill: None,
        }
    }

    /// Queue a failure for an upcoming `fulfill` call
    pub fn push_failure(&self, err: FulfillError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Trip the token once fulfillment succeeds, so the run halts at the
    /// next stage boundary
    pub fn cancel_after_fulfill(mut self, token: CancelToken) -> Self {
        self.cancel_after_fulfill = Some(token);
        self
    }

    /// Counter handle that stays readable after the client moves into a
    /// pipeline
    pub fn fulfill_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fulfill_calls)
    }

    pub fn download_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.download_calls)
    }
}

#[async_trait]
impl FulfillmentClient for MockFulfillmentClient {
    async fn fulfill(
        &self,
        _descriptor: &LicenseDescriptor,
        _credentials: &DeviceCredentials,
    ) -> Result<FulfillmentResponse, FulfillError> {
        self.fulfill_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let response = fulfillment::parse_response(&self.response_xml)?;
        if let Some(token) = &self.cancel_after_fulfill {
            token.cancel();
        }
        Ok(response)
    }

    async fn download(&self, _url: &Url) -> Result<Vec<u8>, FulfillError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.container.clone())
    }
}
