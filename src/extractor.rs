//! Tag extraction: research material in, validated [`AttributeRecord`] out.
//!
//! The generation capability is asked for one JSON object per attempt. Its output
//! is parsed and re-validated here; on violations the next prompt carries the
//! violation list so the model can correct itself.

use crate::budget::CostLedger;
use crate::config::RunConfig;
use crate::errors::{AppError, Capability};
use crate::generation_client::{GenerationRequest, StructuredGenerator};
use crate::models::{ContactIdentity, ResearchMaterial};
use crate::rate_governor::RateGovernor;
use crate::retry::{governed_call, CallError, RetryPolicy};
use crate::schema::{schema_description, validate_value, AttributeRecord, SECTION_NAMES};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = "You turn web research about one person into audience-segmentation \
attributes. Use only facts supported by the research or reasonable inferences from it. \
Every section must be present; use an empty object when nothing is known. \
Values are strings, arrays of strings, or nested objects of those.";

/// Knobs for one extraction, taken from the run configuration.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub validation_attempts: u32,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub max_prompt_chars: usize,
}

impl From<&RunConfig> for ExtractionSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            validation_attempts: run.validation_attempts,
            retry: run.extraction_retry.clone(),
            timeout: run.call_timeout(),
            max_prompt_chars: run.max_prompt_chars,
        }
    }
}

/// A validated record and the number of generation calls it took.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: AttributeRecord,
    pub attempts: u32,
}

/// Shared context for the calls one extraction makes.
pub struct CallScope<'a> {
    pub governor: &'a RateGovernor,
    pub ledger: &'a CostLedger,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone)]
pub struct TagExtractor {
    generator: Arc<dyn StructuredGenerator>,
}

impl TagExtractor {
    pub fn new(generator: Arc<dyn StructuredGenerator>) -> Self {
        Self { generator }
    }

    pub async fn extract(
        &self,
        material: &ResearchMaterial,
        identity: &ContactIdentity,
        settings: &ExtractionSettings,
        scope: &CallScope<'_>,
    ) -> Result<Extraction, CallError> {
        if material.is_empty() {
            tracing::info!(
                identity_key = %identity.identity_key(),
                "No research found, storing empty record"
            );
            return Ok(Extraction {
                record: finalize(AttributeRecord::empty(), material, 0),
                attempts: 0,
            });
        }

        let base_prompt = build_prompt(material, identity, settings.max_prompt_chars);
        let mut calls = 0u32;
        let mut feedback: Option<String> = None;

        let max_attempts = settings.validation_attempts.max(1);
        for attempt in 1..=max_attempts {
            let request = GenerationRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt: match &feedback {
                    Some(violations) => correction_prompt(&base_prompt, violations),
                    None => base_prompt.clone(),
                },
                schema: schema_description(),
            };

            if let Err(error) = scope.ledger.charge(Capability::Extraction) {
                return Err(CallError {
                    error,
                    attempts: calls,
                });
            }

            let candidate = match governed_call(
                Capability::Extraction,
                scope.governor,
                &settings.retry,
                settings.timeout,
                scope.cancel,
                || self.generator.generate(&request),
            )
            .await
            {
                Ok((raw, used)) => {
                    calls += used;
                    match parse_json_object(&raw) {
                        Ok(value) => validate_value(&value).map_err(|v| v.to_string()),
                        Err(e) => Err(e),
                    }
                }
                // no usable content counts against the validation attempts
                Err(e) if matches!(e.error.root(), AppError::SchemaViolation(_)) => {
                    calls += e.attempts;
                    Err(format!("$: {}", schema_violation_message(&e.error)))
                }
                Err(e) => {
                    return Err(CallError {
                        error: e.error,
                        attempts: calls + e.attempts,
                    })
                }
            };

            match candidate {
                Ok(record) => {
                    if attempt > 1 {
                        tracing::info!(
                            identity_key = %identity.identity_key(),
                            attempt,
                            "✓ Generation output valid after correction"
                        );
                    }
                    return Ok(Extraction {
                        record: finalize(record, material, calls),
                        attempts: calls,
                    });
                }
                Err(violations) => {
                    tracing::warn!(
                        identity_key = %identity.identity_key(),
                        attempt,
                        "Generation output rejected: {}",
                        violations
                    );
                    feedback = Some(violations);
                }
            }
        }

        Err(CallError {
            error: AppError::SchemaViolation(format!(
                "no conforming output after {} attempts: {}",
                max_attempts,
                feedback.unwrap_or_default()
            )),
            attempts: calls,
        })
    }
}

fn schema_violation_message(error: &AppError) -> String {
    match error.root() {
        AppError::SchemaViolation(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Prompt body: who the person is, then each source, capped at `max_chars`.
pub fn build_prompt(material: &ResearchMaterial, identity: &ContactIdentity, max_chars: usize) -> String {
    let mut prompt = format!("Person: {}\nEmail: {}\n", identity.full_name.trim(), identity.identity_key());
    if let Some(company) = identity.company() {
        prompt.push_str(&format!("Company: {}\n", company));
    }
    if let Some(locality) = identity.address.as_ref().and_then(|a| a.locality()) {
        prompt.push_str(&format!("Location: {}\n", locality));
    }
    prompt.push_str(&format!(
        "\nRequired sections: {}\n\nResearch:\n",
        SECTION_NAMES.join(", ")
    ));

    for (idx, entry) in material.entries.iter().enumerate() {
        let block = format!("\n[{}] {}\n{}\n", idx + 1, entry.source, entry.text.trim());
        let remaining = max_chars.saturating_sub(prompt.chars().count());
        if remaining == 0 {
            break;
        }
        if block.chars().count() > remaining {
            prompt.extend(block.chars().take(remaining));
            tracing::debug!("Research truncated at source {} of {}", idx + 1, material.source_count());
            break;
        }
        prompt.push_str(&block);
    }
    prompt
}

fn correction_prompt(base: &str, violations: &str) -> String {
    format!(
        "{}\n\nYour previous response was rejected for these schema violations:\n{}\n\
         Return a corrected JSON object containing every required section.",
        base, violations
    )
}

/// Parses a JSON object out of model text, tolerating code fences and prose around it.
pub fn parse_json_object(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&unfenced[start..=end])
            .map_err(|e| format!("$: response is not valid JSON ({})", e)),
        _ => Err("$: response contains no JSON object".to_string()),
    }
}

fn finalize(mut record: AttributeRecord, material: &ResearchMaterial, attempts: u32) -> AttributeRecord {
    record
        .metadata
        .insert("extracted_at".to_string(), Utc::now().to_rfc3339().into());
    record
        .metadata
        .insert("source_count".to_string(), material.source_count().to_string().into());
    record
        .metadata
        .insert("extraction_attempts".to_string(), attempts.to_string().into());

    if record.image.is_none() {
        record.image = material
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| url::Url::parse(image).is_ok())
            .map(str::to_string);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::rate_governor::CapabilityLimits;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, AppError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, AppError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StructuredGenerator for Scripted {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(AppError::InternalError("script exhausted".to_string())))
        }
    }

    fn valid_reply() -> String {
        let mut value = serde_json::Map::new();
        for name in SECTION_NAMES {
            value.insert(name.to_string(), serde_json::json!({}));
        }
        value.insert(
            "professional_profile".to_string(),
            serde_json::json!({ "current_role": { "title": "CEO", "company": "Acme" } }),
        );
        format!("```json\n{}\n```", Value::Object(value))
    }

    fn settings() -> ExtractionSettings {
        ExtractionSettings {
            validation_attempts: 3,
            retry: RetryPolicy::new(2, 1, 2),
            timeout: Duration::from_secs(1),
            max_prompt_chars: 4_000,
        }
    }

    fn material() -> ResearchMaterial {
        let mut material = ResearchMaterial::empty();
        material.push("https://acme.example/team", "Jane Doe is CEO of Acme");
        material
    }

    async fn run(generator: Arc<Scripted>, material: &ResearchMaterial) -> Result<Extraction, CallError> {
        let governor = RateGovernor::new(&CapabilityLimits::new(1, None), &CapabilityLimits::new(1, None));
        let ledger = CostLedger::new(&BudgetConfig::default());
        let cancel = CancellationToken::new();
        let scope = CallScope {
            governor: &governor,
            ledger: &ledger,
            cancel: &cancel,
        };
        TagExtractor::new(generator)
            .extract(material, &ContactIdentity::new("Jane Doe", "jane@x.com"), &settings(), &scope)
            .await
    }

    #[tokio::test]
    async fn test_correction_prompt_echoes_violations() {
        let generator = Scripted::new(vec![
            Ok("{\"professional_profile\": {}}".to_string()),
            Ok(valid_reply()),
        ]);
        let extraction = run(generator.clone(), &material()).await.unwrap();
        assert_eq!(extraction.attempts, 2);
        assert_eq!(extraction.record.metadata["extraction_attempts"].as_text(), Some("2"));

        let prompts = generator.prompts.lock().unwrap();
        assert!(!prompts[0].contains("rejected"));
        assert!(prompts[1].contains("$.identity_signals: missing required section"));
    }

    #[tokio::test]
    async fn test_validation_attempts_exhausted() {
        let generator = Scripted::new(vec![
            Ok("not json".to_string()),
            Ok("[]".to_string()),
            Ok("{}".to_string()),
        ]);
        let err = run(generator, &material()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.error, AppError::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn test_empty_completion_is_asked_again() {
        let generator = Scripted::new(vec![
            Err(AppError::SchemaViolation("generation returned no content".to_string())),
            Ok(valid_reply()),
        ]);
        let extraction = run(generator.clone(), &material()).await.unwrap();
        assert_eq!(extraction.attempts, 2);

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[1].contains("$: generation returned no content"));
    }

    #[tokio::test]
    async fn test_empty_completions_exhaust_validation_attempts() {
        let empty = || Err(AppError::SchemaViolation("generation returned no content".to_string()));
        let generator = Scripted::new(vec![empty(), empty(), empty(), Ok(valid_reply())]);
        let err = run(generator.clone(), &material()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.error.to_string().contains("after 3 attempts"));
        assert_eq!(generator.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_zero_validation_attempts_reports_one() {
        let governor = RateGovernor::new(&CapabilityLimits::new(1, None), &CapabilityLimits::new(1, None));
        let ledger = CostLedger::new(&BudgetConfig::default());
        let cancel = CancellationToken::new();
        let scope = CallScope {
            governor: &governor,
            ledger: &ledger,
            cancel: &cancel,
        };
        let settings = ExtractionSettings {
            validation_attempts: 0,
            ..settings()
        };
        let err = TagExtractor::new(Scripted::new(vec![Ok("[]".to_string())]))
            .extract(&material(), &ContactIdentity::new("Jane Doe", "jane@x.com"), &settings, &scope)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(err.error.to_string().contains("after 1 attempts"));
    }

    #[tokio::test]
    async fn test_empty_material_skips_generation() {
        let generator = Scripted::new(vec![]);
        let extraction = run(generator.clone(), &ResearchMaterial::empty()).await.unwrap();
        assert_eq!(extraction.attempts, 0);
        assert!(extraction.record.has_no_findings());
        assert_eq!(extraction.record.metadata["source_count"].as_text(), Some("0"));
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_research_image_copied() {
        let mut material = material();
        material.image = Some("https://img.example/jane.png".to_string());
        let extraction = run(Scripted::new(vec![Ok(valid_reply())]), &material).await.unwrap();
        assert_eq!(extraction.record.image.as_deref(), Some("https://img.example/jane.png"));
        assert!(extraction.record.revalidate().is_ok());
    }

    #[test]
    fn test_parse_json_object_variants() {
        assert!(parse_json_object("{\"a\": 1}").is_ok());
        assert!(parse_json_object("```\n{\"a\": 1}\n```").is_ok());
        assert!(parse_json_object("Here you go: {\"a\": 1} hope it helps").is_ok());
        assert!(parse_json_object("no braces").is_err());
    }

    #[test]
    fn test_prompt_is_capped() {
        let mut material = ResearchMaterial::empty();
        for i in 0..20 {
            material.push(format!("https://s{}.example", i), "x".repeat(1_000));
        }
        let prompt = build_prompt(&material, &ContactIdentity::new("Jane Doe", "jane@x.com"), 5_000);
        assert_eq!(prompt.chars().count(), 5_000);
        assert!(prompt.contains("[1] https://s0.example"));
        assert!(!prompt.contains("[19]"));
    }
}
