//! # unseal
//!
//! A document license-liberation pipeline: parse a vendor license
//! descriptor, perform the signed fulfillment handshake, reconstruct the
//! rights record the vendor strips from its downloads, repair the container,
//! and decrypt its content entries with the device's RSA key.
//!
//! ## Features
//!
//! - License descriptor parsing with up-front expiry rejection
//! - Signed fulfillment handshake and container download over HTTPS
//! - Rights-record reconstruction across both known schema versions
//! - PKCS#8 to PKCS#1 device-key re-encoding with byte-exact validation
//! - Container repair that preserves the archive layout invariants
//! - AES-128-CBC content decryption with per-entry IVs
//! - A persistent, resumable orchestrator with retry, backoff, and ranked
//!   fallback strategies on terminal failure
//! - Bounded-concurrency batch processing
//!
//! ## Example
//!
//! ```no_run
//! use unseal::{
//!     DeviceKey, HttpFulfillmentClient, MemoryDeviceKeyStore, MemoryRunStore, Pipeline,
//!     PipelineConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = MemoryDeviceKeyStore::new();
//! let pem = std::fs::read_to_string("device-key.pem")?;
//! keys.register("reader-01", DeviceKey::from_pem(&pem)?)?;
//!
//! let pipeline = Pipeline::new(
//!     HttpFulfillmentClient::new()?,
//!     keys,
//!     MemoryRunStore::new(),
//!     PipelineConfig::default(),
//! );
//!
//! let descriptor = std::fs::read("loan.license")?;
//! let run = pipeline.execute(&descriptor, "reader-01").await?;
//! match run.failure_report() {
//!     Some(report) => eprintln!("{report}"),
//!     None => println!("decrypted container at {:?}", run.artifacts.decrypted_path),
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod container;
pub mod crypto;
pub mod device;
pub mod error;
pub mod fulfillment;
pub mod keycodec;
pub mod license;
pub mod model;
pub mod pipeline;
pub mod rights;

mod xml;

pub use batch::{BatchOutcome, BatchRequest, run_batch};
pub use container::{DecryptedContainer, EncryptedContainer, EncryptionManifest, ManifestEntry};
pub use device::{
    DeviceCredentials, DeviceKey, DeviceKeyStore, DirDeviceKeyStore, MemoryDeviceKeyStore,
};
pub use error::{Error, Result};
pub use fulfillment::{FulfillmentClient, HttpFulfillmentClient};
pub use model::{
    ContentScheme, FulfillmentResponse, IvConvention, KeyWrap, LicenseDescriptor, SchemaVersion,
};
#[cfg(feature = "sled-store")]
pub use pipeline::SledRunStore;
pub use pipeline::{
    CancelToken, FailureReason, FailureReport, MemoryRunStore, Pipeline, PipelineConfig,
    PipelineRun, RunState, RunStore, Stage,
};
pub use rights::RightsRecord;
