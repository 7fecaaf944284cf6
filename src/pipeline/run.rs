//! Run records
//!
//! A [`PipelineRun`] is the persistent journal of one liberation attempt:
//! which stage it is in, how each stage ended, which artifacts exist under
//! the run workdir, and which fallback strategies were recommended once it
//! failed. Records serialize with `serde` so a run can be stored, inspected,
//! and resumed after its process is long gone.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{
    DecryptError, FulfillError, KeyCodecError, ParseError, RepairError, RightsError, StoreError,
};
use crate::model::{ContentScheme, FulfillmentResponse, LicenseDescriptor};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Parse the vendor license descriptor
    ParsingLicense,
    /// Handshake with the fulfillment server and download the container
    Fulfilling,
    /// Rebuild the rights record from the fulfillment response
    BuildingRights,
    /// Re-encode the device key to its raw PKCS#1 form
    ConvertingKey,
    /// Inject the rights record into the container
    RepairingContainer,
    /// Decrypt the manifest-listed entries
    Decrypting,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Stage; 6] = [
        Stage::ParsingLicense,
        Stage::Fulfilling,
        Stage::BuildingRights,
        Stage::ConvertingKey,
        Stage::RepairingContainer,
        Stage::Decrypting,
    ];

    /// The stage after this one, or `None` after the last
    pub fn next(self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    /// Stable name used in logs and reports
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ParsingLicense => "parsing-license",
            Stage::Fulfilling => "fulfilling",
            Stage::BuildingRights => "building-rights",
            Stage::ConvertingKey => "converting-key",
            Stage::RepairingContainer => "repairing-container",
            Stage::Decrypting => "decrypting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable digest of a stage error
///
/// The orchestrator folds every component error into one of these; `code`
/// keys the pivot table and `retryable` drives the backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Stable error code, e.g. `U2001`
    pub code: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Whether the stage may be retried for this reason
    pub retryable: bool,
}

impl FailureReason {
    /// Mark this reason terminal, keeping code and message
    pub fn into_terminal(mut self) -> FailureReason {
        self.retryable = false;
        self
    }
}

impl From<&ParseError> for FailureReason {
    fn from(e: &ParseError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
        }
    }
}

impl From<&FulfillError> for FailureReason {
    fn from(e: &FulfillError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<&RightsError> for FailureReason {
    fn from(e: &RightsError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
        }
    }
}

impl From<&KeyCodecError> for FailureReason {
    fn from(e: &KeyCodecError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
        }
    }
}

impl From<&RepairError> for FailureReason {
    fn from(e: &RepairError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
        }
    }
}

impl From<&DecryptError> for FailureReason {
    fn from(e: &DecryptError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<&StoreError> for FailureReason {
    fn from(e: &StoreError) -> Self {
        FailureReason {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
        }
    }
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Not reached yet
    Pending,
    /// Completed; the run moved past it
    Succeeded,
    /// Failed but eligible for another attempt
    RetryableFailure(FailureReason),
    /// Failed for good; the run halts here
    TerminalFailure(FailureReason),
}

impl StageStatus {
    /// Whether this stage completed
    pub fn is_succeeded(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }

    /// Whether this stage failed terminally
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::TerminalFailure(_))
    }
}

/// One stage's journal line: status plus how many attempts it consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Which stage this records
    pub stage: Stage,
    /// Latest status
    pub status: StageStatus,
    /// Attempts consumed so far
    pub attempts: u32,
}

impl StageRecord {
    fn new(stage: Stage) -> Self {
        StageRecord {
            stage,
            status: StageStatus::Pending,
            attempts: 0,
        }
    }
}

/// Overall state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunState {
    /// Executing or about to execute the named stage
    Running(Stage),
    /// Every stage succeeded
    Done,
    /// A stage failed terminally
    Failed {
        /// Stage the run halted in
        stage: Stage,
        /// Why it halted
        reason: FailureReason,
    },
    /// Cancelled between stages; resumable
    Cancelled {
        /// First stage a resume would execute
        resume_from: Stage,
    },
}

/// Everything a run produced so far, for diagnosis and resume
///
/// Container bytes live as files under the run workdir; the record only
/// keeps their paths plus the small values. The device key is deliberately
/// never recorded here, resume re-fetches it from the key store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArtifacts {
    /// Parsed license descriptor
    pub descriptor: Option<LicenseDescriptor>,
    /// Raw fulfillment response body, kept verbatim
    pub fulfillment_raw: Option<String>,
    /// Parsed fulfillment response
    pub fulfillment: Option<FulfillmentResponse>,
    /// Rendered rights XML
    pub rights_xml: Option<String>,
    /// Content scheme the run resolved for decryption
    pub scheme: Option<ContentScheme>,
    /// SHA-256 of the downloaded container bytes, lowercase hex
    pub download_digest: Option<String>,
    /// Downloaded (still stripped) container file
    pub downloaded_path: Option<PathBuf>,
    /// Repaired container file
    pub repaired_path: Option<PathBuf>,
    /// Decrypted container file
    pub decrypted_path: Option<PathBuf>,
}

/// Persistent journal of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id, time-ordered
    pub id: Uuid,
    /// Device the run fulfills for
    pub device_id: String,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
    /// Overall state
    pub state: RunState,
    /// Per-stage journal, seeded with every stage pending
    pub stages: Vec<StageRecord>,
    /// Fallback strategies already tried by a human or an alternate adapter
    pub attempted_pivots: Vec<String>,
    /// Ranked fallback strategies recorded at terminal failure
    pub recommended_pivots: Vec<String>,
    /// Artifacts produced so far
    pub artifacts: RunArtifacts,
}

impl PipelineRun {
    /// Create a fresh run for a device, pending at the first stage
    pub fn new(device_id: impl Into<String>) -> Self {
        let now = Utc::now();
        PipelineRun {
            id: Uuid::now_v7(),
            device_id: device_id.into(),
            created_at: now,
            updated_at: now,
            state: RunState::Running(Stage::ParsingLicense),
            stages: Stage::ALL.iter().copied().map(StageRecord::new).collect(),
            attempted_pivots: Vec::new(),
            recommended_pivots: Vec::new(),
            artifacts: RunArtifacts::default(),
        }
    }

    /// The journal line for a stage, if present
    pub fn stage_record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Mutable journal line for a stage, inserted if a stored record lacks it
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        let index = match self.stages.iter().position(|r| r.stage == stage) {
            Some(index) => index,
            None => {
                self.stages.push(StageRecord::new(stage));
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }

    /// First stage that has not succeeded, in execution order
    ///
    /// `None` means every stage completed.
    pub fn first_incomplete_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| {
            !self
                .stage_record(*stage)
                .is_some_and(|r| r.status.is_succeeded())
        })
    }

    /// Bump the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Structured report for a failed run, `None` otherwise
    pub fn failure_report(&self) -> Option<FailureReport> {
        match &self.state {
            RunState::Failed { stage, reason } => Some(FailureReport {
                run_id: self.id,
                stage: *stage,
                reason: reason.clone(),
                pivots: self.recommended_pivots.clone(),
            }),
            _ => None,
        }
    }
}

/// Structured account of a terminal failure
///
/// Rendered instead of a bare error chain so operators see the failed stage,
/// the coded reason, and the ranked fallback strategies in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Which run failed
    pub run_id: Uuid,
    /// Stage the run halted in
    pub stage: Stage,
    /// Why it halted
    pub reason: FailureReason,
    /// Ranked fallback strategies, best first
    pub pivots: Vec<String>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} failed during {}: [{}] {}",
            self.run_id, self.stage, self.reason.code, self.reason.message
        )?;
        if self.pivots.is_empty() {
            write!(f, "\nno fallback strategies on file for this failure")?;
        } else {
            write!(f, "\nranked fallback strategies:")?;
            for (rank, pivot) in self.pivots.iter().enumerate() {
                write!(f, "\n  {}. {pivot}", rank + 1)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ParsingLicense.next(), Some(Stage::Fulfilling));
        assert_eq!(Stage::Fulfilling.next(), Some(Stage::BuildingRights));
        assert_eq!(Stage::BuildingRights.next(), Some(Stage::ConvertingKey));
        assert_eq!(Stage::ConvertingKey.next(), Some(Stage::RepairingContainer));
        assert_eq!(Stage::RepairingContainer.next(), Some(Stage::Decrypting));
        assert_eq!(Stage::Decrypting.next(), None);
    }

    #[test]
    fn test_fresh_run_shape() {
        let run = PipelineRun::new("device-1");
        assert_eq!(run.state, RunState::Running(Stage::ParsingLicense));
        assert_eq!(run.stages.len(), Stage::ALL.len());
        assert!(run.stages.iter().all(|r| r.status == StageStatus::Pending));
        assert_eq!(run.first_incomplete_stage(), Some(Stage::ParsingLicense));
        assert!(run.failure_report().is_none());
    }

    #[test]
    fn test_first_incomplete_skips_succeeded() {
        let mut run = PipelineRun::new("device-1");
        run.stage_mut(Stage::ParsingLicense).status = StageStatus::Succeeded;
        run.stage_mut(Stage::Fulfilling).status = StageStatus::Succeeded;
        assert_eq!(run.first_incomplete_stage(), Some(Stage::BuildingRights));

        for stage in Stage::ALL {
            run.stage_mut(stage).status = StageStatus::Succeeded;
        }
        assert_eq!(run.first_incomplete_stage(), None);
    }

    #[test]
    fn test_run_serde_round_trip() {
        let mut run = PipelineRun::new("device-1");
        run.artifacts.rights_xml = Some("<rights/>".to_string());
        run.artifacts.download_digest = Some("ab".repeat(32));
        run.stage_mut(Stage::ParsingLicense).status = StageStatus::Succeeded;
        run.stage_mut(Stage::ParsingLicense).attempts = 1;

        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn test_failure_reason_classification() {
        let network = FulfillError::NetworkError("connect timed out".to_string());
        let reason = FailureReason::from(&network);
        assert_eq!(reason.code, "U2001");
        assert!(reason.retryable);
        assert!(!reason.into_terminal().retryable);

        let rejected = FulfillError::ServerRejected {
            code: "E_LOAN_LIMIT".to_string(),
            message: "loan limit reached".to_string(),
        };
        assert!(!FailureReason::from(&rejected).retryable);

        let corrupt = DecryptError::corrupt_entry("OEBPS/ch1.xhtml", "bad padding");
        let reason = FailureReason::from(&corrupt);
        assert_eq!(reason.code, "U6003");
        assert!(reason.retryable);

        let mismatch = DecryptError::KeyMismatch("unwrap failed".to_string());
        assert!(!FailureReason::from(&mismatch).retryable);
    }

    #[test]
    fn test_failure_report_display() {
        let mut run = PipelineRun::new("device-1");
        run.state = RunState::Failed {
            stage: Stage::Fulfilling,
            reason: FailureReason {
                code: "U2002".to_string(),
                message: "server refused the device credentials".to_string(),
                retryable: false,
            },
        };
        run.recommended_pivots = vec![
            "re-authorize the device with the vendor".to_string(),
            "switch to the alternate fulfillment endpoint".to_string(),
        ];

        let report = run.failure_report().unwrap();
        let text = report.to_string();
        assert!(text.contains("failed during fulfilling"));
        assert!(text.contains("[U2002]"));
        assert!(text.contains("1. re-authorize the device with the vendor"));
        assert!(text.contains("2. switch to the alternate fulfillment endpoint"));
    }
}
