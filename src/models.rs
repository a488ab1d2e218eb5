use crate::errors::AppError;
use crate::schema::AttributeRecord;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ============ Input Models ============

/// Postal address fields, all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalAddress {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl PostalAddress {
    /// "City, Region" when either is known.
    pub fn locality(&self) -> Option<String> {
        let parts: Vec<&str> = [self.city.as_deref(), self.region.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

/// Confidence-scored identity anchor produced by upstream identity verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAnchor {
    /// Opaque reference into the upstream registry (e.g. a profile URL).
    pub reference: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Immutable per-run input describing one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactIdentity {
    pub full_name: String,
    /// Primary email; the identity key.
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address: Option<PostalAddress>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub anchor: Option<IdentityAnchor>,
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Checks basic email shape: `local@domain.tld`.
pub fn is_valid_email(email: &str) -> bool {
    email.len() >= 5 && email_regex().is_match(email)
}

impl ContactIdentity {
    pub fn new(full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
            company: None,
            address: None,
            phone: None,
            anchor: None,
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_address(mut self, address: PostalAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Normalized identity key: trimmed, lowercased email.
    pub fn identity_key(&self) -> String {
        self.email.trim().to_lowercase()
    }

    pub fn company(&self) -> Option<&str> {
        self.company
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Rejects identities no capability should ever be called for.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.full_name.trim().is_empty() {
            return Err(AppError::BadRequest("full_name is empty".to_string()));
        }
        let key = self.identity_key();
        if key.is_empty() {
            return Err(AppError::BadRequest("email is empty".to_string()));
        }
        if !is_valid_email(&key) {
            return Err(AppError::BadRequest(format!("email '{}' is malformed", key)));
        }
        if let Some(anchor) = &self.anchor {
            if !(0.0..=1.0).contains(&anchor.confidence) {
                return Err(AppError::BadRequest(format!(
                    "identity anchor confidence {} outside [0, 1]",
                    anchor.confidence
                )));
            }
        }
        Ok(())
    }
}

// ============ Research Models ============

/// One piece of research: where it came from and what it said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchEntry {
    pub source: String,
    pub text: String,
}

/// Output of a research provider for one contact. Zero entries means nothing was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchMaterial {
    pub entries: Vec<ResearchEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ResearchMaterial {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: impl Into<String>, text: impl Into<String>) {
        self.entries.push(ResearchEntry {
            source: source.into(),
            text: text.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.entries.len()
    }

    /// Opaque audit blob persisted next to the structured record.
    pub fn to_blob(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============ Stored Models ============

/// The persisted unit of truth for one identity key (internal projection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedContact {
    pub identity_key: String,
    pub full_name: String,
    pub company: Option<String>,
    pub tags: AttributeRecord,
    /// Raw research blob, opaque after extraction.
    pub raw_research: String,
    /// SHA-256 of `raw_research`, hex encoded.
    pub research_checksum: String,
    /// When the pipeline run that produced this record started processing it.
    pub processed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every accepted write.
    pub revision: i64,
}

impl EnrichedContact {
    /// Derives the external projection. Never touches tags or research.
    pub fn external(&self) -> ExternalContact {
        ExternalContact {
            identity_key: self.identity_key.clone(),
            display_name: self.full_name.clone(),
            company: self.company.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// External (redacted) projection: identity, display name, company, timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalContact {
    pub identity_key: String,
    pub display_name: String,
    pub company: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a pipeline hands to the store for one contact.
#[derive(Debug, Clone)]
pub struct NewEnrichment {
    pub identity: ContactIdentity,
    pub tags: AttributeRecord,
    pub material: ResearchMaterial,
    pub processed_at: DateTime<Utc>,
}

// ============ Outcome Models ============

/// Per-contact state machine stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Researching,
    Extracting,
    Storing,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Legal forward transitions; `Failed` is reachable from any non-terminal stage.
    pub fn can_transition_to(self, next: Stage) -> bool {
        match (self, next) {
            (from, Stage::Failed) => !from.is_terminal(),
            (Stage::Pending, Stage::Researching)
            | (Stage::Researching, Stage::Extracting)
            | (Stage::Extracting, Stage::Storing)
            | (Stage::Storing, Stage::Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::Researching => "researching",
            Stage::Extracting => "extracting",
            Stage::Storing => "storing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a contact did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures or validation failures outlasted the retry bound.
    RetryableExhausted,
    /// Rejected without retry (bad input, auth, quota, request-specific rejection).
    Permanent,
    /// The batch was cancelled before this contact finished.
    Cancelled,
    /// Intake stopped before this contact started.
    Halted,
    /// The run budget did not cover this contact's next call.
    BudgetExceeded,
    /// A newer processing of the same identity key was already stored.
    Superseded,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RetryableExhausted => "failed-retryable-exhausted",
            FailureKind::Permanent => "failed-permanent",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Halted => "halted",
            FailureKind::BudgetExceeded => "budget-exceeded",
            FailureKind::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}

/// Structured record of one contact's failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub identity_key: String,
    /// Stage at which the contact failed.
    pub stage: Stage,
    pub kind: FailureKind,
    /// Human-readable stage + cause.
    pub cause: String,
    /// Calls made in the failing stage.
    pub attempts: u32,
}

/// Result for one input contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContactOutcome {
    Succeeded { contact: Box<EnrichedContact> },
    /// A recent enrichment was already stored; nothing was called or charged.
    Reused { contact: Box<EnrichedContact> },
    Failed(FailureDescriptor),
}

impl ContactOutcome {
    pub fn failed(
        identity_key: impl Into<String>,
        stage: Stage,
        kind: FailureKind,
        cause: impl Into<String>,
        attempts: u32,
    ) -> Self {
        ContactOutcome::Failed(FailureDescriptor {
            identity_key: identity_key.into(),
            stage,
            kind,
            cause: cause.into(),
            attempts,
        })
    }

    pub fn identity_key(&self) -> &str {
        match self {
            ContactOutcome::Succeeded { contact } | ContactOutcome::Reused { contact } => {
                &contact.identity_key
            }
            ContactOutcome::Failed(failure) => &failure.identity_key,
        }
    }

    /// Succeeded or reused: the contact has a stored enrichment.
    pub fn is_success(&self) -> bool {
        !matches!(self, ContactOutcome::Failed(_))
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, ContactOutcome::Reused { .. })
    }

    pub fn failure(&self) -> Option<&FailureDescriptor> {
        match self {
            ContactOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn contact(&self) -> Option<&EnrichedContact> {
        match self {
            ContactOutcome::Succeeded { contact } | ContactOutcome::Reused { contact } => Some(contact),
            ContactOutcome::Failed(_) => None,
        }
    }
}
