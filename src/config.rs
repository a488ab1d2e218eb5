use crate::budget::BudgetConfig;
use crate::errors::AppError;
use crate::rate_governor::CapabilityLimits;
use crate::retry::{RetryPolicy, MAX_BACKOFF_MS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base URL plus credential for one external API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub api_key: String,
}

/// Which research provider variant to run, selected by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum ProviderSettings {
    /// Web search followed by per-page content extraction.
    ComposedSearch {
        search: ApiEndpoint,
        extract: ApiEndpoint,
        max_urls: usize,
    },
    /// One call to a deep-research service.
    DeepResearch { endpoint: ApiEndpoint },
    /// Returns no research; for dry runs.
    Stub,
}

/// Structured-generation (chat completions) settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenerationSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Grants access to internal projections and batch submission.
    pub internal_api_key: String,
    /// Grants access to the external projection only.
    pub external_api_key: Option<String>,
    pub provider: ProviderSettings,
    pub generation: GenerationSettings,
    /// Defaults for runs that do not send their own configuration.
    pub default_run: RunConfig,
}

fn required(name: &str) -> anyhow::Result<String> {
    let value = std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))?;
    if value.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    Ok(value)
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn required_url(name: &str) -> anyhow::Result<String> {
    let url = required(name)?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn endpoint(url_var: &str, key_var: &str) -> anyhow::Result<ApiEndpoint> {
    Ok(ApiEndpoint {
        base_url: required_url(url_var)?,
        api_key: required(key_var)?,
    })
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = required("DATABASE_URL").and_then(|url| {
            if !url.starts_with("sqlite:") {
                anyhow::bail!("DATABASE_URL must start with sqlite:");
            }
            Ok(url)
        })?;

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?;

        let provider = match optional("RESEARCH_PROVIDER")
            .unwrap_or_else(|| "composed".to_string())
            .to_lowercase()
            .as_str()
        {
            "composed" => ProviderSettings::ComposedSearch {
                search: endpoint("SEARCH_BASE_URL", "SEARCH_API_KEY")?,
                extract: endpoint("EXTRACT_BASE_URL", "EXTRACT_API_KEY")?,
                max_urls: optional("RESEARCH_MAX_URLS")
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|_| anyhow::anyhow!("RESEARCH_MAX_URLS must be a positive integer"))?
                    .unwrap_or(10),
            },
            "deep" => ProviderSettings::DeepResearch {
                endpoint: endpoint("DEEP_RESEARCH_BASE_URL", "DEEP_RESEARCH_API_KEY")?,
            },
            "stub" => ProviderSettings::Stub,
            other => anyhow::bail!(
                "RESEARCH_PROVIDER must be one of composed, deep, stub (got '{}')",
                other
            ),
        };

        let generation = GenerationSettings {
            base_url: optional("LLM_BASE_URL")
                .map(|_| required_url("LLM_BASE_URL"))
                .transpose()?
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: required("LLM_API_KEY")?,
            model: optional("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        };

        let mut default_run = RunConfig::default();
        if let Some(concurrency) = optional("BATCH_CONCURRENCY") {
            default_run.concurrency = concurrency
                .parse()
                .map_err(|_| anyhow::anyhow!("BATCH_CONCURRENCY must be a positive integer"))?;
        }
        if let Some(limit) = optional("BUDGET_LIMIT_USD") {
            default_run.budget.limit_usd = Some(
                limit
                    .parse()
                    .map_err(|_| anyhow::anyhow!("BUDGET_LIMIT_USD must be a number"))?,
            );
        }
        default_run
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid default run configuration: {}", e))?;

        let config = Self {
            database_url,
            port,
            internal_api_key: required("INTERNAL_API_KEY")?,
            external_api_key: optional("EXTERNAL_API_KEY"),
            provider,
            generation,
            default_run,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Database URL: {}", config.database_url);
        tracing::debug!("Research provider: {}", config.provider.kind());
        tracing::debug!("Generation model: {} @ {}", config.generation.model, config.generation.base_url);
        if config.external_api_key.is_none() {
            tracing::warn!("EXTERNAL_API_KEY not set; external projection requires the internal key");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

impl ProviderSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderSettings::ComposedSearch { .. } => "composed-search",
            ProviderSettings::DeepResearch { .. } => "deep-research",
            ProviderSettings::Stub => "stub",
        }
    }
}

/// Per-run configuration accepted by the batch entry point. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Contacts processed concurrently.
    pub concurrency: usize,
    pub research_limits: CapabilityLimits,
    pub extraction_limits: CapabilityLimits,
    /// Transient-failure retries for research calls.
    pub research_retry: RetryPolicy,
    /// Transient-failure retries for each generation call.
    pub extraction_retry: RetryPolicy,
    /// Generation attempts allowed while output keeps failing validation.
    pub validation_attempts: u32,
    pub storage_retry: RetryPolicy,
    /// Timeout applied to every external call.
    pub call_timeout_ms: u64,
    /// Research text beyond this many characters is left out of the prompt.
    pub max_prompt_chars: usize,
    /// Stop intake when a capability is rejected outright (auth, quota).
    pub halt_on_permanent: bool,
    /// Reuse stored enrichments processed within this many seconds instead of
    /// researching again. Resubmitting a halted batch with this set resumes it.
    pub reuse_enriched_within_secs: Option<u64>,
    pub budget: BudgetConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            // 5 req/s ceiling on research
            research_limits: CapabilityLimits::new(4, Some(18_000)),
            extraction_limits: CapabilityLimits::new(4, None),
            research_retry: RetryPolicy::new(3, 4_000, 10_000),
            extraction_retry: RetryPolicy::new(3, 1_000, 10_000),
            validation_attempts: 3,
            storage_retry: RetryPolicy::new(3, 200, 2_000),
            call_timeout_ms: 60_000,
            max_prompt_chars: 24_000,
            halt_on_permanent: true,
            reuse_enriched_within_secs: None,
            budget: BudgetConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Oldest `processed_at` a stored enrichment may have and still be reused.
    pub fn reuse_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = self.reuse_enriched_within_secs?;
        let cutoff = i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| now.checked_sub_signed(window));
        Some(cutoff.unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let bad = |msg: &str| Err(AppError::BadRequest(format!("run config: {}", msg)));
        if self.concurrency == 0 {
            return bad("concurrency must be at least 1");
        }
        if self.research_limits.max_in_flight == 0 || self.extraction_limits.max_in_flight == 0 {
            return bad("max_in_flight must be at least 1");
        }
        for policy in [
            &self.research_retry,
            &self.extraction_retry,
            &self.storage_retry,
        ] {
            if policy.max_attempts == 0 {
                return bad("retry max_attempts must be at least 1");
            }
            if policy.initial_backoff_ms > policy.max_backoff_ms {
                return bad("retry initial_backoff_ms must not exceed max_backoff_ms");
            }
            if policy.max_backoff_ms > MAX_BACKOFF_MS {
                return bad("retry max_backoff_ms must be at most 300000");
            }
        }
        if self.validation_attempts == 0 {
            return bad("validation_attempts must be at least 1");
        }
        if self.call_timeout_ms == 0 {
            return bad("call_timeout_ms must be positive");
        }
        if self.max_prompt_chars < 1_000 {
            return bad("max_prompt_chars must be at least 1000");
        }
        if let Some(limit) = self.budget.limit_usd {
            if !limit.is_finite() || limit < 0.0 {
                return bad("budget limit must be a non-negative number");
            }
        }
        Ok(())
    }
}
