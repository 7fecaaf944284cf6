//! Pipeline orchestration
//!
//! The orchestrator drives the six stages strictly forward, persists the run
//! journal at every boundary, and owns the whole retry policy: retryable
//! failures get bounded exponential backoff with jitter, terminal failures
//! get a ranked pivot list from [`pivot::strategies`] recorded on the run.
//! Stage work itself lives in the component modules; this module only
//! sequences them and folds their typed errors into [`FailureReason`]s.

pub mod pivot;
pub mod run;
pub mod store;

pub use run::{
    FailureReason, FailureReport, PipelineRun, RunArtifacts, RunState, Stage, StageRecord,
    StageStatus,
};
#[cfg(feature = "sled-store")]
pub use store::SledRunStore;
pub use store::{MemoryRunStore, RunStore};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::container::{DecryptedContainer, EncryptedContainer, decrypt_with_scheme, inject_rights};
use crate::device::{DeviceCredentials, DeviceKeyStore};
use crate::error::StoreError;
use crate::fulfillment::FulfillmentClient;
use crate::keycodec;
use crate::license;
use crate::model::{ContentScheme, FulfillmentResponse, LicenseDescriptor, SchemaVersion};
use crate::rights::{self, RightsRecord};

/// Cooperative cancellation flag shared with a running pipeline
///
/// Checked between stages only; a stage that has started always runs to its
/// end. Clone the token and hand one half to the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation; takes effect at the next stage boundary
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Total attempts a stage gets for retryable network failures
    pub max_attempts: u32,
    /// First backoff delay; doubles with each further attempt
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay, before jitter
    pub backoff_cap: Duration,
    /// HTTP request timeout for the fulfillment client
    pub request_timeout: Duration,
    /// Concurrent runs allowed by the batch driver
    pub batch_concurrency: usize,
    /// Directory receiving per-run artifact files
    pub workdir: PathBuf,
    /// Per-version overrides of the content scheme
    pub scheme_overrides: HashMap<SchemaVersion, ContentScheme>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            request_timeout: crate::fulfillment::DEFAULT_REQUEST_TIMEOUT,
            batch_concurrency: 4,
            workdir: std::env::temp_dir().join("unseal"),
            scheme_overrides: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// The content scheme decryption will use for a schema version
    pub fn scheme_for(&self, version: SchemaVersion) -> ContentScheme {
        self.scheme_overrides
            .get(&version)
            .copied()
            .unwrap_or_else(|| version.default_scheme())
    }
}

/// Everything one in-flight run carries between stages
///
/// Stage outputs that are too large or too sensitive for the persisted
/// record live here; resume rebuilds this from artifacts and the key store.
#[derive(Default)]
struct RunContext {
    descriptor_bytes: Vec<u8>,
    descriptor: Option<LicenseDescriptor>,
    credentials: Option<DeviceCredentials>,
    response: Option<FulfillmentResponse>,
    rights: Option<RightsRecord>,
    raw_key: Option<Vec<u8>>,
    container: Option<EncryptedContainer>,
}

/// Drives runs through the stage sequence
///
/// The fulfillment client, device key store, and run store are injected so
/// alternate implementations can be substituted per pivot strategy without
/// touching the orchestration.
pub struct Pipeline<F, K, S> {
    client: F,
    keys: K,
    store: S,
    config: PipelineConfig,
}

impl<F, K, S> Pipeline<F, K, S>
where
    F: FulfillmentClient,
    K: DeviceKeyStore,
    S: RunStore,
{
    /// Assemble a pipeline from its collaborators
    pub fn new(client: F, keys: K, store: S, config: PipelineConfig) -> Self {
        Pipeline {
            client,
            keys,
            store,
            config,
        }
    }

    /// The configuration this pipeline runs with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The run store this pipeline persists into
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the full pipeline for one descriptor
    pub async fn execute(
        &self,
        descriptor_bytes: &[u8],
        device_id: &str,
    ) -> Result<PipelineRun, StoreError> {
        self.execute_cancellable(descriptor_bytes, device_id, &CancelToken::new())
            .await
    }

    /// Run the full pipeline, checking the token between stages
    ///
    /// Stage failures do not surface as `Err`: they end up in the returned
    /// run's state and journal. `Err` here means the pipeline itself could
    /// not make progress, i.e. the run store failed.
    #[instrument(skip_all, fields(device_id = %device_id))]
    pub async fn execute_cancellable(
        &self,
        descriptor_bytes: &[u8],
        device_id: &str,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, StoreError> {
        let run = PipelineRun::new(device_id);
        info!(run_id = %run.id, "pipeline run created");
        let ctx = RunContext {
            descriptor_bytes: descriptor_bytes.to_vec(),
            ..RunContext::default()
        };
        self.drive(run, ctx, cancel).await
    }

    /// Resume a persisted run from its first incomplete stage
    pub async fn resume(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        self.resume_cancellable(run_id, &CancelToken::new()).await
    }

    /// Resume a persisted run, checking the token between stages
    ///
    /// Completed stages are not repeated; their outputs are reloaded from
    /// the run's artifacts and workdir files. The device key is re-fetched
    /// from the key store, never from the record. Stages that had failed get
    /// a fresh attempt budget, and pivots recommended at the earlier failure
    /// move to the run's attempted set.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume_cancellable(
        &self,
        run_id: Uuid,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, StoreError> {
        let mut run = self
            .store
            .load(run_id)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let Some(next_stage) = run.first_incomplete_stage() else {
            run.state = RunState::Done;
            run.touch();
            self.store.save(&run)?;
            return Ok(run);
        };

        for record in &mut run.stages {
            if !record.status.is_succeeded() {
                record.status = StageStatus::Pending;
                record.attempts = 0;
            }
        }
        run.state = RunState::Running(next_stage);
        for pivot in run.recommended_pivots.drain(..) {
            if !run.attempted_pivots.contains(&pivot) {
                run.attempted_pivots.push(pivot);
            }
        }

        let ctx = self.rebuild_context(&run)?;
        info!(run_id = %run.id, resume_from = %next_stage, "resuming run");
        self.drive(run, ctx, cancel).await
    }

    /// Advance a run stage by stage until done, cancelled, or failed
    async fn drive(
        &self,
        mut run: PipelineRun,
        mut ctx: RunContext,
        cancel: &CancelToken,
    ) -> Result<PipelineRun, StoreError> {
        let workdir = self.config.workdir.join(run.id.to_string());

        while let Some(stage) = run.first_incomplete_stage() {
            if cancel.is_cancelled() {
                run.state = RunState::Cancelled { resume_from: stage };
                run.touch();
                self.store.save(&run)?;
                info!(run_id = %run.id, stage = %stage, "run cancelled between stages");
                return Ok(run);
            }

            run.state = RunState::Running(stage);
            run.touch();
            self.store.save(&run)?;

            loop {
                let attempt = run.stage_mut(stage).attempts + 1;
                run.stage_mut(stage).attempts = attempt;
                info!(run_id = %run.id, stage = %stage, attempt, "stage starting");

                match self.run_stage(stage, &mut run, &mut ctx, &workdir).await {
                    Ok(()) => {
                        run.stage_mut(stage).status = StageStatus::Succeeded;
                        run.touch();
                        self.store.save(&run)?;
                        info!(run_id = %run.id, stage = %stage, attempt, "stage succeeded");
                        break;
                    }
                    Err(reason) => {
                        let allowed = allowed_attempts(&self.config, &reason);
                        if reason.retryable && attempt < allowed {
                            let delay = backoff_delay(&self.config, attempt);
                            warn!(
                                run_id = %run.id,
                                stage = %stage,
                                attempt,
                                code = %reason.code,
                                delay_ms = delay.as_millis() as u64,
                                "stage failed, backing off before retry"
                            );
                            run.stage_mut(stage).status = StageStatus::RetryableFailure(reason);
                            run.touch();
                            self.store.save(&run)?;
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        let reason = reason.into_terminal();
                        let pivots: Vec<String> = pivot::strategies(stage, &reason.code)
                            .iter()
                            .map(|s| s.to_string())
                            .collect();
                        error!(
                            run_id = %run.id,
                            stage = %stage,
                            attempt,
                            code = %reason.code,
                            message = %reason.message,
                            "stage failed terminally"
                        );
                        run.stage_mut(stage).status = StageStatus::TerminalFailure(reason.clone());
                        run.recommended_pivots = pivots;
                        run.state = RunState::Failed { stage, reason };
                        run.touch();
                        self.store.save(&run)?;
                        return Ok(run);
                    }
                }
            }
        }

        run.state = RunState::Done;
        run.touch();
        self.store.save(&run)?;
        info!(run_id = %run.id, "run complete");
        Ok(run)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        workdir: &Path,
    ) -> Result<(), FailureReason> {
        match stage {
            Stage::ParsingLicense => self.parse_license(run, ctx),
            Stage::Fulfilling => self.fulfill_and_download(run, ctx, workdir).await,
            Stage::BuildingRights => self.build_rights(run, ctx),
            Stage::ConvertingKey => self.convert_key(run, ctx),
            Stage::RepairingContainer => self.repair_container(run, ctx, workdir).await,
            Stage::Decrypting => self.decrypt_container(run, ctx, workdir).await,
        }
    }

    fn parse_license(&self, run: &mut PipelineRun, ctx: &mut RunContext) -> Result<(), FailureReason> {
        let descriptor =
            license::parse(&ctx.descriptor_bytes).map_err(|e| FailureReason::from(&e))?;
        run.artifacts.descriptor = Some(descriptor.clone());
        ctx.descriptor = Some(descriptor);
        Ok(())
    }

    async fn fulfill_and_download(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        workdir: &Path,
    ) -> Result<(), FailureReason> {
        let descriptor = ctx
            .descriptor
            .clone()
            .ok_or_else(|| missing_context("the parsed descriptor"))?;
        self.load_credentials(run, ctx)?;
        let credentials = ctx
            .credentials
            .as_ref()
            .ok_or_else(|| missing_context("the device credentials"))?;

        let response = self
            .client
            .fulfill(&descriptor, credentials)
            .await
            .map_err(|e| FailureReason::from(&e))?;
        run.artifacts.fulfillment_raw = Some(response.raw_payload.clone());
        run.artifacts.fulfillment = Some(response.clone());

        let bytes = self
            .client
            .download(&response.download_url)
            .await
            .map_err(|e| FailureReason::from(&e))?;
        run.artifacts.download_digest = Some(hex::encode(Sha256::digest(&bytes)));

        let container =
            EncryptedContainer::from_bytes(bytes).map_err(|e| FailureReason::from(&e))?;

        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(store_failure)?;
        let path = workdir.join("downloaded.zip");
        tokio::fs::write(&path, container.as_bytes())
            .await
            .map_err(store_failure)?;
        run.artifacts.downloaded_path = Some(path);

        ctx.response = Some(response);
        ctx.container = Some(container);
        Ok(())
    }

    fn build_rights(&self, run: &mut PipelineRun, ctx: &mut RunContext) -> Result<(), FailureReason> {
        let response = ctx
            .response
            .as_ref()
            .ok_or_else(|| missing_context("the fulfillment response"))?;
        let record = rights::build(response).map_err(|e| FailureReason::from(&e))?;
        run.artifacts.rights_xml = Some(record.to_xml());
        run.artifacts.scheme = Some(self.config.scheme_for(record.schema_version));
        ctx.rights = Some(record);
        Ok(())
    }

    fn convert_key(&self, run: &mut PipelineRun, ctx: &mut RunContext) -> Result<(), FailureReason> {
        self.load_credentials(run, ctx)?;
        let credentials = ctx
            .credentials
            .as_ref()
            .ok_or_else(|| missing_context("the device credentials"))?;
        let raw = keycodec::ensure_raw(&credentials.key).map_err(|e| FailureReason::from(&e))?;
        ctx.raw_key = Some(raw);
        Ok(())
    }

    async fn repair_container(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        workdir: &Path,
    ) -> Result<(), FailureReason> {
        let container = ctx
            .container
            .take()
            .ok_or_else(|| missing_context("the downloaded container"))?;
        let record = ctx
            .rights
            .as_ref()
            .ok_or_else(|| missing_context("the rights record"))?;
        let repaired = inject_rights(container, record).map_err(|e| FailureReason::from(&e))?;

        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(store_failure)?;
        let path = workdir.join("repaired.zip");
        tokio::fs::write(&path, repaired.as_bytes())
            .await
            .map_err(store_failure)?;
        run.artifacts.repaired_path = Some(path);

        ctx.container = Some(repaired);
        Ok(())
    }

    async fn decrypt_container(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        workdir: &Path,
    ) -> Result<(), FailureReason> {
        let container = ctx
            .container
            .as_ref()
            .ok_or_else(|| missing_context("the repaired container"))?;
        let raw_key = ctx
            .raw_key
            .as_ref()
            .ok_or_else(|| missing_context("the raw device key"))?;

        let decrypted = decrypt_with_scheme(container, raw_key, run.artifacts.scheme)
            .map_err(|e| FailureReason::from(&e))?;

        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(store_failure)?;
        let path = workdir.join("decrypted.zip");
        tokio::fs::write(&path, decrypted.as_bytes())
            .await
            .map_err(store_failure)?;
        run.artifacts.decrypted_path = Some(path);
        Ok(())
    }

    /// Load the decrypted container a finished run wrote to its workdir
    pub fn decrypted_container(&self, run: &PipelineRun) -> Result<DecryptedContainer, StoreError> {
        let path = run
            .artifacts
            .decrypted_path
            .as_ref()
            .ok_or_else(|| StoreError::missing_artifact("decrypted container file"))?;
        let bytes = std::fs::read(path)?;
        DecryptedContainer::from_bytes(bytes)
            .map_err(|e| StoreError::Backend(format!("decrypted artifact is unusable: {e}")))
    }

    /// Fetch the device key into the context unless already present
    fn load_credentials(
        &self,
        run: &PipelineRun,
        ctx: &mut RunContext,
    ) -> Result<(), FailureReason> {
        if ctx.credentials.is_none() {
            let key = self
                .keys
                .device_key(&run.device_id)
                .map_err(|e| FailureReason::from(&e))?;
            ctx.credentials = Some(DeviceCredentials {
                device_id: run.device_id.clone(),
                key,
            });
        }
        Ok(())
    }

    /// Rebuild the in-flight context for a resumed run from its artifacts
    fn rebuild_context(&self, run: &PipelineRun) -> Result<RunContext, StoreError> {
        let mut ctx = RunContext::default();
        let Some(resume_from) = run.first_incomplete_stage() else {
            return Ok(ctx);
        };

        ctx.descriptor = run.artifacts.descriptor.clone();
        ctx.response = run.artifacts.fulfillment.clone();
        if let Some(xml) = &run.artifacts.rights_xml {
            let record = RightsRecord::parse(xml).map_err(|e| {
                StoreError::Backend(format!("stored rights record does not parse: {e}"))
            })?;
            ctx.rights = Some(record);
        }

        let container_path = if run
            .stage_record(Stage::RepairingContainer)
            .is_some_and(|r| r.status.is_succeeded())
        {
            run.artifacts.repaired_path.as_ref()
        } else {
            run.artifacts.downloaded_path.as_ref()
        };
        if let Some(path) = container_path {
            let bytes = std::fs::read(path)?;
            let container = EncryptedContainer::from_bytes(bytes).map_err(|e| {
                StoreError::Backend(format!("stored container artifact is unusable: {e}"))
            })?;
            ctx.container = Some(container);
        }

        if run
            .stage_record(Stage::ConvertingKey)
            .is_some_and(|r| r.status.is_succeeded())
        {
            let key = self.keys.device_key(&run.device_id)?;
            let raw = keycodec::ensure_raw(&key).map_err(|e| {
                StoreError::Backend(format!("device key no longer converts: {e}"))
            })?;
            ctx.credentials = Some(DeviceCredentials {
                device_id: run.device_id.clone(),
                key,
            });
            ctx.raw_key = Some(raw);
        }

        match resume_from {
            Stage::ParsingLicense => {
                return Err(StoreError::missing_artifact(
                    "license descriptor bytes; submit the descriptor as a new run",
                ));
            }
            Stage::Fulfilling => {
                if ctx.descriptor.is_none() {
                    return Err(StoreError::missing_artifact("parsed license descriptor"));
                }
            }
            Stage::BuildingRights => {
                if ctx.response.is_none() {
                    return Err(StoreError::missing_artifact("fulfillment response"));
                }
            }
            Stage::ConvertingKey => {}
            Stage::RepairingContainer => {
                if ctx.container.is_none() {
                    return Err(StoreError::missing_artifact("downloaded container file"));
                }
                if ctx.rights.is_none() {
                    return Err(StoreError::missing_artifact("rights record"));
                }
            }
            Stage::Decrypting => {
                if ctx.container.is_none() {
                    return Err(StoreError::missing_artifact("repaired container file"));
                }
            }
        }

        Ok(ctx)
    }
}

fn missing_context(what: &str) -> FailureReason {
    FailureReason {
        code: "U7006".to_string(),
        message: format!("run context is missing {what}"),
        retryable: false,
    }
}

fn store_failure(e: std::io::Error) -> FailureReason {
    FailureReason::from(&StoreError::Io(e))
}

/// Total attempts a stage gets for this failure before escalation
fn allowed_attempts(config: &PipelineConfig, reason: &FailureReason) -> u32 {
    match reason.code.as_str() {
        // Network failures get the full configured budget
        "U2001" => config.max_attempts.max(1),
        // Padding failure gets exactly one retry
        "U6003" => 2,
        _ => 1,
    }
}

/// Backoff before the next attempt: base doubling per attempt, capped, jittered
fn backoff_delay(config: &PipelineConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(exponent));
    let capped = raw.min(config.backoff_cap);
    if capped.is_zero() {
        return capped;
    }
    let jitter = rand::rng().random_range(Duration::ZERO..=capped / 2);
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyWrap;

    fn config_with(base_ms: u64, cap_ms: u64) -> PipelineConfig {
        PipelineConfig {
            backoff_base: Duration::from_millis(base_ms),
            backoff_cap: Duration::from_millis(cap_ms),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config_with(100, 1_000);

        let first = backoff_delay(&config, 1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let second = backoff_delay(&config, 2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));

        let late = backoff_delay(&config, 30);
        assert!(late >= Duration::from_millis(1_000) && late <= Duration::from_millis(1_500));
    }

    #[test]
    fn test_backoff_zero_base_stays_zero() {
        let config = config_with(0, 0);
        assert_eq!(backoff_delay(&config, 1), Duration::ZERO);
    }

    #[test]
    fn test_allowed_attempts_by_code() {
        let config = PipelineConfig::default();

        let network = FailureReason {
            code: "U2001".to_string(),
            message: String::new(),
            retryable: true,
        };
        assert_eq!(allowed_attempts(&config, &network), 3);

        let padding = FailureReason {
            code: "U6003".to_string(),
            message: String::new(),
            retryable: true,
        };
        assert_eq!(allowed_attempts(&config, &padding), 2);

        let auth = FailureReason {
            code: "U2002".to_string(),
            message: String::new(),
            retryable: false,
        };
        assert_eq!(allowed_attempts(&config, &auth), 1);
    }

    #[test]
    fn test_scheme_override_lookup() {
        let mut config = PipelineConfig::default();
        assert_eq!(
            config.scheme_for(SchemaVersion::V1).key_wrap,
            KeyWrap::Pkcs1v15
        );

        let forced = ContentScheme {
            key_wrap: KeyWrap::OaepSha1,
            iv: crate::model::IvConvention::CiphertextPrefix(16),
        };
        config.scheme_overrides.insert(SchemaVersion::V1, forced);
        assert_eq!(
            config.scheme_for(SchemaVersion::V1).key_wrap,
            KeyWrap::OaepSha1
        );
    }

    #[test]
    fn test_cancel_token_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = rand::rng();
        for _ in 0..32 {
            let cap_ms = rng.random_range(1..=5_000u64);
            let config = config_with(cap_ms, cap_ms);
            let delay = backoff_delay(&config, 1);
            assert!(delay >= Duration::from_millis(cap_ms));
            assert!(delay <= Duration::from_millis(cap_ms + cap_ms / 2 + 1));
        }
    }
}
