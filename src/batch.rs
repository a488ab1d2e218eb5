use crate::budget::CostSummary;
use crate::config::RunConfig;
use crate::db_storage::EnrichmentStorage;
use crate::enrichment::{enrich_contact, HaltReason, PipelineServices, RunContext};
use crate::errors::AppError;
use crate::extractor::TagExtractor;
use crate::generation_client::StructuredGenerator;
use crate::models::{ContactIdentity, ContactOutcome, FailureKind, Stage};
use crate::research::ResearchProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a caller gets back from one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One outcome per input contact, in input order.
    pub outcomes: Vec<ContactOutcome>,
    pub halt_reason: Option<HaltReason>,
    pub cost: CostSummary,
    /// Includes `reused`.
    pub succeeded: usize,
    /// Contacts answered from a recent stored enrichment.
    pub reused: usize,
    pub failed: usize,
}

/// First escalation wins; raising it also wakes the intake loop.
struct HaltSignal {
    reason: Mutex<Option<HaltReason>>,
    token: CancellationToken,
}

impl HaltSignal {
    fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    fn raise(&self, reason: HaltReason) {
        if let Ok(mut current) = self.reason.lock() {
            if current.is_none() {
                tracing::warn!("Halting intake: {}", reason);
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<HaltReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }
}

type Lane = Vec<(usize, ContactIdentity)>;

/// Groups inputs by identity key. Each lane is processed sequentially, so the
/// same key is never enriched twice at once; lanes are ordered by first appearance.
fn build_lanes(identities: Vec<ContactIdentity>) -> Vec<Lane> {
    let mut lanes: Vec<Lane> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (idx, identity) in identities.into_iter().enumerate() {
        let key = identity.identity_key();
        match by_key.get(&key) {
            Some(&lane) => lanes[lane].push((idx, identity)),
            None => {
                by_key.insert(key, lanes.len());
                lanes.push(vec![(idx, identity)]);
            }
        }
    }
    lanes
}

/// Outcome for a contact whose worker task died before reporting.
fn worker_failed(identity_key: String, stage: Stage, error: &JoinError) -> ContactOutcome {
    let cause = if error.is_panic() {
        "worker panicked"
    } else {
        "worker aborted"
    };
    ContactOutcome::failed(
        identity_key,
        stage,
        FailureKind::Permanent,
        format!("{}: {}", stage, cause),
        0,
    )
}

/// Runs one lane to completion while holding its concurrency slot. Each contact
/// runs on its own task so a panic fails that contact alone.
async fn run_lane(
    lane: Lane,
    services: PipelineServices,
    run: Arc<RunContext>,
    halt: Arc<HaltSignal>,
    _slot: OwnedSemaphorePermit,
) -> Vec<(usize, ContactOutcome)> {
    let mut finished = Vec::with_capacity(lane.len());
    for (idx, identity) in lane {
        if run.cancel.is_cancelled() || halt.token.is_cancelled() {
            break;
        }
        let identity_key = identity.identity_key();
        let (progress, stage) = watch::channel(Stage::Pending);
        let worker = {
            let services = services.clone();
            let run = run.clone();
            tokio::spawn(async move { enrich_contact(&services, &run, &identity, &progress).await })
        };
        match worker.await {
            Ok(report) => {
                if let Some(reason) = report.escalation {
                    halt.raise(reason);
                }
                finished.push((idx, report.outcome));
            }
            Err(e) => {
                let reached = *stage.borrow();
                tracing::error!(
                    run_id = %run.run_id,
                    identity_key = %identity_key,
                    stage = %reached,
                    "Contact worker failed: {}",
                    e
                );
                finished.push((idx, worker_failed(identity_key, reached, &e)));
            }
        }
    }
    finished
}

/// Drives batches of contacts through research, extraction and storage.
#[derive(Clone)]
pub struct BatchOrchestrator {
    services: PipelineServices,
}

impl BatchOrchestrator {
    pub fn new(
        provider: Arc<dyn ResearchProvider>,
        generator: Arc<dyn StructuredGenerator>,
        storage: EnrichmentStorage,
    ) -> Self {
        Self {
            services: PipelineServices {
                provider,
                extractor: TagExtractor::new(generator),
                storage,
            },
        }
    }

    pub fn storage(&self) -> &EnrichmentStorage {
        &self.services.storage
    }

    /// Processes every identity and returns one outcome per input, in input order.
    ///
    /// Per-contact failures never fail the batch. Cancellation and escalations
    /// stop new contacts from starting; contacts already running finish and
    /// contacts never started are reported as cancelled or halted.
    pub async fn process_batch(
        &self,
        identities: Vec<ContactIdentity>,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<BatchReport, AppError> {
        config.validate()?;

        let started_at = Utc::now();
        let total = identities.len();
        let keys: Vec<String> = identities.iter().map(|i| i.identity_key()).collect();
        let concurrency = config.concurrency;
        let run = Arc::new(RunContext::new(config, cancel));
        let halt = Arc::new(HaltSignal::new());
        let slots = Arc::new(Semaphore::new(concurrency));

        tracing::info!(
            run_id = %run.run_id,
            "Starting batch: {} contacts, concurrency {}",
            total,
            concurrency
        );

        // Lanes start in order of first appearance, each once a slot is free
        let mut tasks = JoinSet::new();
        let mut lane_members: HashMap<tokio::task::Id, Vec<usize>> = HashMap::new();
        for lane in build_lanes(identities) {
            let slot = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                _ = halt.token.cancelled() => break,
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            let members = lane.iter().map(|(idx, _)| *idx).collect();
            let handle = tasks.spawn(run_lane(
                lane,
                self.services.clone(),
                run.clone(),
                halt.clone(),
                slot,
            ));
            lane_members.insert(handle.id(), members);
        }

        let mut outcomes: Vec<Option<ContactOutcome>> = vec![None; total];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, finished)) => {
                    for (idx, outcome) in finished {
                        outcomes[idx] = Some(outcome);
                    }
                }
                Err(e) => {
                    tracing::error!(run_id = %run.run_id, "Lane task failed: {}", e);
                    for idx in lane_members.remove(&e.id()).unwrap_or_default() {
                        outcomes[idx] = Some(worker_failed(keys[idx].clone(), Stage::Pending, &e));
                    }
                }
            }
        }

        let halt_reason = halt
            .reason()
            .or_else(|| run.cancel.is_cancelled().then_some(HaltReason::Cancelled));

        let outcomes: Vec<ContactOutcome> = outcomes
            .into_iter()
            .zip(keys)
            .map(|(outcome, key)| {
                outcome.unwrap_or_else(|| {
                    let reason = halt_reason.unwrap_or(HaltReason::Cancelled);
                    ContactOutcome::failed(
                        key,
                        Stage::Pending,
                        reason.unstarted_kind(),
                        format!("pending: not started, {}", reason),
                        0,
                    )
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let reused = outcomes.iter().filter(|o| o.is_reused()).count();
        let report = BatchReport {
            run_id: run.run_id,
            started_at,
            finished_at: Utc::now(),
            failed: outcomes.len() - succeeded,
            succeeded,
            reused,
            outcomes,
            halt_reason,
            cost: run.ledger.summary(),
        };

        tracing::info!(
            run_id = %report.run_id,
            "Batch finished: {} succeeded ({} reused), {} failed, ${:.3} spent{}",
            report.succeeded,
            report.reused,
            report.failed,
            report.cost.total_usd,
            report
                .halt_reason
                .map(|r| format!(" (halted: {})", r))
                .unwrap_or_default()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_keys_share_a_lane() {
        let lanes = build_lanes(vec![
            ContactIdentity::new("Jane Doe", "jane@x.com"),
            ContactIdentity::new("John Roe", "john@x.com"),
            ContactIdentity::new("Jane D.", "JANE@x.com"),
        ]);
        assert_eq!(lanes.len(), 2);
        let first: Vec<usize> = lanes[0].iter().map(|(idx, _)| *idx).collect();
        assert_eq!(first, vec![0, 2]);
        assert_eq!(lanes[1][0].0, 1);
    }

    #[test]
    fn test_first_halt_reason_wins() {
        let halt = HaltSignal::new();
        halt.raise(HaltReason::BudgetExceeded);
        halt.raise(HaltReason::StorageUnavailable);
        assert_eq!(halt.reason(), Some(HaltReason::BudgetExceeded));
        assert!(halt.token.is_cancelled());
    }
}
