//! Per-contact enrichment state machine.
//!
//! pending → researching → extracting → storing → done, with `failed` reachable
//! from any non-terminal stage. Capability failures are recovered here and
//! reported as a failure descriptor; conditions that should stop the whole
//! batch are reported alongside as an escalation.
use crate::budget::CostLedger;
use crate::config::RunConfig;
use crate::db_storage::{EnrichmentStorage, UpsertOutcome};
use crate::errors::{AppError, Capability};
use crate::extractor::{CallScope, ExtractionSettings, TagExtractor};
use crate::models::{ContactIdentity, ContactOutcome, FailureKind, NewEnrichment, Stage};
use crate::rate_governor::RateGovernor;
use crate::research::ResearchProvider;
use crate::retry::{governed_call, retry_storage, CallError, RetryPolicy};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a batch stopped taking new contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    Cancelled,
    BudgetExceeded,
    /// Every contact needs this capability and it rejected our credentials or quota.
    CapabilityRejected { capability: Capability },
    /// Writes kept failing; results can no longer be made durable.
    StorageUnavailable,
}

impl HaltReason {
    /// Failure kind reported for contacts that never started because of this halt.
    pub fn unstarted_kind(self) -> FailureKind {
        match self {
            HaltReason::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Halted,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Cancelled => write!(f, "batch cancelled"),
            HaltReason::BudgetExceeded => write!(f, "budget exhausted"),
            HaltReason::CapabilityRejected { capability } => {
                write!(f, "{} capability rejected", capability)
            }
            HaltReason::StorageUnavailable => write!(f, "storage unavailable"),
        }
    }
}

/// Collaborators shared by every contact in every run.
#[derive(Clone)]
pub struct PipelineServices {
    pub provider: Arc<dyn ResearchProvider>,
    pub extractor: TagExtractor,
    pub storage: EnrichmentStorage,
}

/// Batch-scoped state: one governor and ledger per run, shared by reference.
pub struct RunContext {
    pub run_id: Uuid,
    pub config: RunConfig,
    pub governor: RateGovernor,
    pub ledger: CostLedger,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: RunConfig, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            governor: RateGovernor::new(&config.research_limits, &config.extraction_limits),
            ledger: CostLedger::new(&config.budget),
            config,
            cancel,
        }
    }
}

/// Terminal result of one contact plus any batch-level escalation it raised.
#[derive(Debug, Clone)]
pub struct ContactReport {
    pub outcome: ContactOutcome,
    pub escalation: Option<HaltReason>,
}

struct StageTracker<'a> {
    identity_key: String,
    run_id: &'a Uuid,
    stage: Stage,
    progress: &'a watch::Sender<Stage>,
}

impl<'a> StageTracker<'a> {
    fn advance(&mut self, next: Stage) {
        debug_assert!(self.stage.can_transition_to(next), "{} -> {}", self.stage, next);
        tracing::debug!(
            run_id = %self.run_id,
            identity_key = %self.identity_key,
            from = %self.stage,
            to = %next,
            "Stage transition"
        );
        self.stage = next;
        self.progress.send_replace(next);
    }

    fn fail(&self, kind: FailureKind, cause: impl fmt::Display, attempts: u32, escalation: Option<HaltReason>) -> ContactReport {
        tracing::warn!(
            run_id = %self.run_id,
            identity_key = %self.identity_key,
            stage = %self.stage,
            kind = %kind,
            attempts,
            "Contact failed: {}",
            cause
        );
        ContactReport {
            outcome: ContactOutcome::failed(
                self.identity_key.clone(),
                self.stage,
                kind,
                format!("{}: {}", self.stage, cause),
                attempts,
            ),
            escalation,
        }
    }

    /// Maps a capability call failure onto the failure taxonomy.
    fn fail_call(&self, err: CallError, halt_on_permanent: bool) -> ContactReport {
        let CallError { error, attempts } = err;
        let (kind, escalation) = match error.root() {
            AppError::Cancelled => (FailureKind::Cancelled, None),
            AppError::BudgetExceeded(_) => (FailureKind::BudgetExceeded, Some(HaltReason::BudgetExceeded)),
            AppError::Transient { .. } | AppError::SchemaViolation(_) => {
                (FailureKind::RetryableExhausted, None)
            }
            AppError::Permanent { capability, .. } => (
                FailureKind::Permanent,
                halt_on_permanent.then_some(HaltReason::CapabilityRejected {
                    capability: *capability,
                }),
            ),
            _ => (FailureKind::Permanent, None),
        };
        self.fail(kind, error, attempts, escalation)
    }

    fn cancelled(&self) -> ContactReport {
        self.fail(FailureKind::Cancelled, "batch cancelled", 0, None)
    }
}

/// Drives one contact through the pipeline. Never returns an error: every exit
/// is a terminal outcome. Each stage entered is published on `progress`.
pub async fn enrich_contact(
    services: &PipelineServices,
    run: &RunContext,
    identity: &ContactIdentity,
    progress: &watch::Sender<Stage>,
) -> ContactReport {
    let mut tracker = StageTracker {
        identity_key: identity.identity_key(),
        run_id: &run.run_id,
        stage: Stage::Pending,
        progress,
    };
    let config = &run.config;

    if let Err(e) = identity.validate() {
        return tracker.fail(FailureKind::Permanent, e, 0, None);
    }
    if run.cancel.is_cancelled() {
        return tracker.cancelled();
    }
    let processed_at = Utc::now();

    if let Some(cutoff) = config.reuse_cutoff(processed_at) {
        match services.storage.get_internal(&tracker.identity_key).await {
            Ok(Some(stored)) if stored.processed_at >= cutoff => {
                tracing::info!(
                    run_id = %run.run_id,
                    identity_key = %tracker.identity_key,
                    processed_at = %stored.processed_at,
                    "Reusing stored enrichment"
                );
                return ContactReport {
                    outcome: ContactOutcome::Reused {
                        contact: Box::new(stored),
                    },
                    escalation: None,
                };
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                identity_key = %tracker.identity_key,
                "Stored enrichment unreadable, enriching again: {}",
                e
            ),
        }
    }

    // researching
    tracker.advance(Stage::Researching);
    if let Err(e) = run.ledger.charge(Capability::Research) {
        return tracker.fail(FailureKind::BudgetExceeded, e, 0, Some(HaltReason::BudgetExceeded));
    }
    let (mut material, _) = match governed_call(
        Capability::Research,
        &run.governor,
        &config.research_retry,
        config.call_timeout(),
        &run.cancel,
        || services.provider.research(identity),
    )
    .await
    {
        Ok(found) => found,
        Err(e) => return tracker.fail_call(e, config.halt_on_permanent),
    };

    if material.image.is_none() {
        if let Some(source) = material.entries.first().map(|entry| entry.source.clone()) {
            match governed_call(
                Capability::Research,
                &run.governor,
                &RetryPolicy::new(1, 0, 0),
                config.call_timeout(),
                &run.cancel,
                || services.provider.extract_image(&source),
            )
            .await
            {
                Ok((image, _)) => material.image = image,
                Err(e) if e.is_cancelled() => return tracker.cancelled(),
                Err(e) => tracing::debug!(
                    identity_key = %tracker.identity_key,
                    "No image for {}: {}",
                    source,
                    e.error
                ),
            }
        }
    }

    if run.cancel.is_cancelled() {
        return tracker.cancelled();
    }

    // extracting
    tracker.advance(Stage::Extracting);
    let scope = CallScope {
        governor: &run.governor,
        ledger: &run.ledger,
        cancel: &run.cancel,
    };
    let extraction = match services
        .extractor
        .extract(&material, identity, &ExtractionSettings::from(config), &scope)
        .await
    {
        Ok(extraction) => extraction,
        Err(e) => return tracker.fail_call(e, config.halt_on_permanent),
    };

    if run.cancel.is_cancelled() {
        return tracker.cancelled();
    }

    // storing: runs to completion even if the batch is cancelled meanwhile
    tracker.advance(Stage::Storing);
    let enrichment = NewEnrichment {
        identity: identity.clone(),
        tags: extraction.record,
        material,
        processed_at,
    };
    match retry_storage(&config.storage_retry, || services.storage.upsert(&enrichment)).await {
        Ok((UpsertOutcome::Written(contact), _)) => {
            tracker.advance(Stage::Done);
            tracing::info!(
                run_id = %run.run_id,
                identity_key = %tracker.identity_key,
                generation_calls = extraction.attempts,
                "✓ Contact enriched"
            );
            ContactReport {
                outcome: ContactOutcome::Succeeded {
                    contact: Box::new(contact),
                },
                escalation: None,
            }
        }
        Ok((UpsertOutcome::Superseded, attempts)) => tracker.fail(
            FailureKind::Superseded,
            "a newer enrichment is already stored",
            attempts,
            None,
        ),
        Err(CallError { error, attempts }) => {
            let kind = match error.root() {
                AppError::DatabaseError(_) => FailureKind::RetryableExhausted,
                _ => FailureKind::Permanent,
            };
            tracker.fail(kind, error, attempts, Some(HaltReason::StorageUnavailable))
        }
    }
}
