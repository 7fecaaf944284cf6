//! Batch processing
//!
//! Runs many descriptors through the pipeline at once. Each request becomes
//! an independent run on its own task; an `Arc<Semaphore>` caps how many
//! execute concurrently, since fulfillment is I/O-bound and the remote
//! service rate-limits aggressively. Runs share nothing mutable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, instrument};

use crate::device::DeviceKeyStore;
use crate::fulfillment::FulfillmentClient;
use crate::pipeline::{CancelToken, Pipeline, PipelineRun, RunState, RunStore};

/// One batch item: a descriptor and the device to fulfill it for
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Raw license descriptor bytes
    pub descriptor: Vec<u8>,
    /// Device whose key unlocks the content
    pub device_id: String,
}

impl BatchRequest {
    /// Bundle descriptor bytes with their device
    pub fn new(descriptor: impl Into<Vec<u8>>, device_id: impl Into<String>) -> Self {
        BatchRequest {
            descriptor: descriptor.into(),
            device_id: device_id.into(),
        }
    }
}

/// What a batch produced
#[derive(Debug)]
pub struct BatchOutcome {
    /// Final run records, in submission order
    pub runs: Vec<PipelineRun>,
    /// Infrastructure errors from runs that could not report a record at all
    pub errors: Vec<String>,
    /// Runs that ended `Done`
    pub succeeded: usize,
    /// Runs that ended `Failed` or `Cancelled`, plus unreportable errors
    pub failed: usize,
    /// Wall-clock duration of the whole batch
    pub duration: Duration,
}

impl BatchOutcome {
    /// Whether every run in the batch completed
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Run every request through the pipeline with bounded concurrency
///
/// The concurrency limit comes from `PipelineConfig::batch_concurrency`.
/// Cancelling the token stops runs at their next stage boundary; requests
/// still waiting on the semaphore start, see the token immediately, and
/// persist as cancelled-before-the-first-stage, so the whole batch remains
/// resumable run by run.
#[instrument(skip_all, fields(total = requests.len()))]
pub async fn run_batch<F, K, S>(
    pipeline: Arc<Pipeline<F, K, S>>,
    requests: Vec<BatchRequest>,
    cancel: CancelToken,
) -> BatchOutcome
where
    F: FulfillmentClient + 'static,
    K: DeviceKeyStore + 'static,
    S: RunStore + 'static,
{
    let started = Instant::now();
    let total = requests.len();
    let limit = pipeline.config().batch_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    info!(total, limit, "batch starting");

    let mut handles = Vec::with_capacity(total);
    for request in requests {
        let pipeline = Arc::clone(&pipeline);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Err("batch semaphore closed".to_string()),
            };
            pipeline
                .execute_cancellable(&request.descriptor, &request.device_id, &cancel)
                .await
                .map_err(|e| e.to_string())
        }));
    }

    let mut outcome = BatchOutcome {
        runs: Vec::with_capacity(total),
        errors: Vec::new(),
        succeeded: 0,
        failed: 0,
        duration: Duration::ZERO,
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(run)) => {
                match run.state {
                    RunState::Done => outcome.succeeded += 1,
                    _ => outcome.failed += 1,
                }
                outcome.runs.push(run);
            }
            Ok(Err(message)) => {
                outcome.failed += 1;
                outcome.errors.push(message);
            }
            Err(join_error) => {
                outcome.failed += 1;
                outcome
                    .errors
                    .push(format!("batch task did not finish: {join_error}"));
            }
        }
    }
    outcome.duration = started.elapsed();
    info!(
        total,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        duration_ms = outcome.duration.as_millis() as u64,
        "batch finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success_flag() {
        let outcome = BatchOutcome {
            runs: Vec::new(),
            errors: Vec::new(),
            succeeded: 2,
            failed: 0,
            duration: Duration::from_millis(5),
        };
        assert!(outcome.all_succeeded());

        let outcome = BatchOutcome {
            failed: 1,
            ..outcome
        };
        assert!(!outcome.all_succeeded());
    }

    #[test]
    fn test_request_construction() {
        let request = BatchRequest::new(b"<licenseDescriptor/>".as_slice(), "device-9");
        assert_eq!(request.device_id, "device-9");
        assert!(!request.descriptor.is_empty());
    }
}
