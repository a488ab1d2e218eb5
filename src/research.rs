use crate::config::ProviderSettings;
use crate::errors::AppError;
use crate::models::{ContactIdentity, ResearchMaterial};
use crate::services::{ComposedSearchProvider, DeepResearchProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Capability contract for web research about one person.
///
/// Implementations make outbound calls only and must not mutate shared state.
/// Returning zero entries is a valid outcome meaning nothing was found.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn research(&self, identity: &ContactIdentity) -> Result<ResearchMaterial, AppError>;

    /// Best-effort image for a source reference. `Ok(None)` when the provider
    /// cannot produce one.
    async fn extract_image(&self, source: &str) -> Result<Option<String>, AppError>;
}

/// Canned research keyed by identity key. Unknown identities get the default
/// material (empty unless set).
#[derive(Debug, Clone, Default)]
pub struct StaticResearchProvider {
    by_key: HashMap<String, ResearchMaterial>,
    default: ResearchMaterial,
}

impl StaticResearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_material(mut self, email: &str, material: ResearchMaterial) -> Self {
        self.by_key.insert(email.trim().to_lowercase(), material);
        self
    }

    pub fn with_default(mut self, material: ResearchMaterial) -> Self {
        self.default = material;
        self
    }
}

#[async_trait]
impl ResearchProvider for StaticResearchProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn research(&self, identity: &ContactIdentity) -> Result<ResearchMaterial, AppError> {
        Ok(self
            .by_key
            .get(&identity.identity_key())
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }

    async fn extract_image(&self, _source: &str) -> Result<Option<String>, AppError> {
        Ok(None)
    }
}

/// Builds the provider variant selected by configuration.
pub fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn ResearchProvider>, AppError> {
    let provider: Arc<dyn ResearchProvider> = match settings {
        ProviderSettings::ComposedSearch {
            search,
            extract,
            max_urls,
        } => Arc::new(ComposedSearchProvider::new(search, extract, *max_urls)?),
        ProviderSettings::DeepResearch { endpoint } => {
            Arc::new(DeepResearchProvider::new(endpoint)?)
        }
        ProviderSettings::Stub => Arc::new(StaticResearchProvider::new()),
    };
    tracing::info!("✓ Research provider initialized: {}", provider.name());
    Ok(provider)
}
