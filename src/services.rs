use crate::config::ApiEndpoint;
use crate::errors::{AppError, Capability};
use crate::models::{ContactIdentity, ResearchMaterial};
use crate::research::ResearchProvider;
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Longest text kept from a single source.
pub const MAX_ENTRY_CHARS: usize = 10_000;

const PAGE_CACHE_TTL: Duration = Duration::from_secs(3600);
const PAGE_CACHE_CAPACITY: u64 = 10_000;
/// Budget for one page extract; a slower page falls back to its search snippet.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(15);
/// Page extracts in flight at once for one research call.
const PAGE_CONCURRENCY: usize = 5;

fn http_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {}", e)))
}

fn clip(text: &str) -> String {
    match text.char_indices().nth(MAX_ENTRY_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Search query built from everything known about the person.
pub fn build_query(identity: &ContactIdentity) -> String {
    let mut parts = vec![format!("\"{}\"", identity.full_name.trim())];
    if let Some(company) = identity.company() {
        parts.push(company.to_string());
    }
    if let Some(locality) = identity.address.as_ref().and_then(|a| a.locality()) {
        parts.push(locality);
    }
    parts.join(" ")
}

/// POSTs JSON with bearer auth and decodes the response, classifying failures.
async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
    client: &Client,
    capability: Capability,
    url: &str,
    token: &str,
    body: &B,
) -> Result<R, AppError> {
    let response = client
        .post(url)
        .bearer_auth(token)
        .json(body)
        .send()
        .await
        .map_err(|e| AppError::from_reqwest(capability, e))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::error!("{} returned error {}: {}", url, status, error_text);
        return Err(AppError::from_status(capability, status, &error_text));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::from_reqwest(capability, e))
}

// ============ Composed search + extraction ============

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    num_results: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    url: &'a str,
}

/// Content pulled from one page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageExtract {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Extract endpoint plus its page cache; cheap to clone into page tasks.
#[derive(Clone)]
struct PageFetcher {
    client: Client,
    endpoint: ApiEndpoint,
    cache: Cache<String, Arc<PageExtract>>,
    timeout: Duration,
}

impl PageFetcher {
    async fn fetch(&self, page_url: &str) -> Result<Arc<PageExtract>, AppError> {
        if let Some(cached) = self.cache.get(page_url).await {
            tracing::debug!("Page cache hit: {}", page_url);
            return Ok(cached);
        }

        let url = format!("{}/extract", self.endpoint.base_url);
        let body = ExtractRequest { url: page_url };
        let request = post_json::<_, PageExtract>(
            &self.client,
            Capability::Research,
            &url,
            &self.endpoint.api_key,
            &body,
        );
        let page = match tokio::time::timeout(self.timeout, request).await {
            Ok(page) => Arc::new(page?),
            Err(_) => {
                return Err(AppError::Transient {
                    capability: Capability::Research,
                    message: format!("page extract timed out after {}ms", self.timeout.as_millis()),
                })
            }
        };

        self.cache.insert(page_url.to_string(), page.clone()).await;
        Ok(page)
    }
}

/// Web search followed by content extraction of the top results.
pub struct ComposedSearchProvider {
    client: Client,
    search: ApiEndpoint,
    pages: PageFetcher,
    max_urls: usize,
}

impl ComposedSearchProvider {
    pub fn new(search: &ApiEndpoint, extract: &ApiEndpoint, max_urls: usize) -> Result<Self, AppError> {
        let client = http_client(Duration::from_secs(45))?;
        Ok(Self {
            pages: PageFetcher {
                client: client.clone(),
                endpoint: extract.clone(),
                cache: Cache::builder()
                    .time_to_live(PAGE_CACHE_TTL)
                    .max_capacity(PAGE_CACHE_CAPACITY)
                    .build(),
                timeout: PAGE_TIMEOUT,
            },
            client,
            search: search.clone(),
            max_urls: max_urls.max(1),
        })
    }

    /// Overrides the per-page extract budget.
    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.pages.timeout = timeout;
        self
    }

    async fn search_web(&self, query: &str) -> Result<Vec<SearchHit>, AppError> {
        let url = format!("{}/search", self.search.base_url);
        tracing::info!("Searching web: {}", query);
        let response: SearchResponse = post_json(
            &self.client,
            Capability::Research,
            &url,
            &self.search.api_key,
            &SearchRequest {
                query,
                num_results: self.max_urls,
            },
        )
        .await?;
        Ok(response.results)
    }

    /// Extracts one page, served from the page cache when possible.
    pub async fn extract_page(&self, page_url: &str) -> Result<Arc<PageExtract>, AppError> {
        self.pages.fetch(page_url).await
    }

    /// Extracts every hit concurrently, at most `PAGE_CONCURRENCY` at a time.
    /// Results come back in hit order.
    async fn extract_pages(
        &self,
        hits: &[SearchHit],
    ) -> Result<Vec<Result<Arc<PageExtract>, AppError>>, AppError> {
        let slots = Arc::new(Semaphore::new(PAGE_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for (idx, hit) in hits.iter().enumerate() {
            let pages = self.pages.clone();
            let slots = slots.clone();
            let page_url = hit.url.clone();
            tasks.spawn(async move {
                let _slot = slots.acquire_owned().await;
                (idx, pages.fetch(&page_url).await)
            });
        }

        let mut results: Vec<Option<Result<Arc<PageExtract>, AppError>>> = vec![None; hits.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                // A rejected capability fails every remaining page too
                Ok((_, Err(e))) if e.is_capability_wide() => return Err(e),
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => tracing::error!("Page extract task failed: {}", e),
            }
        }

        Ok(results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| Err(AppError::InternalError("page extract task failed".to_string())))
            })
            .collect())
    }
}

#[async_trait]
impl ResearchProvider for ComposedSearchProvider {
    fn name(&self) -> &'static str {
        "composed-search"
    }

    async fn research(&self, identity: &ContactIdentity) -> Result<ResearchMaterial, AppError> {
        let query = build_query(identity);
        let mut hits = self.search_web(&query).await?;
        hits.truncate(self.max_urls);
        let pages = self.extract_pages(&hits).await?;
        let mut material = ResearchMaterial::empty();

        for (hit, page) in hits.into_iter().zip(pages) {
            let fallback = [hit.title.as_deref(), hit.snippet.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("\n");

            let text = match page {
                Ok(page) => {
                    if material.image.is_none() {
                        material.image = page.image_url.clone();
                    }
                    if page.text.trim().is_empty() {
                        fallback
                    } else {
                        page.text.clone()
                    }
                }
                Err(e) => {
                    tracing::warn!("Extraction failed for {}, using snippet: {}", hit.url, e);
                    fallback
                }
            };

            if !text.trim().is_empty() {
                material.push(hit.url, clip(&text));
            }
        }

        tracing::info!(
            "Research for {} gathered {} sources",
            identity.identity_key(),
            material.source_count()
        );
        Ok(material)
    }

    async fn extract_image(&self, source: &str) -> Result<Option<String>, AppError> {
        Ok(self.extract_page(source).await?.image_url.clone())
    }
}

// ============ Deep research ============

#[derive(Debug, Serialize)]
struct DeepResearchRequest<'a> {
    query: &'a str,
    name: &'a str,
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    company: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchor: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DeepResearchResponse {
    #[serde(default)]
    sources: Vec<DeepResearchSource>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeepResearchSource {
    url: String,
    #[serde(default)]
    content: String,
}

/// Single-call research service that searches and summarises on its side.
pub struct DeepResearchProvider {
    client: Client,
    endpoint: ApiEndpoint,
}

impl DeepResearchProvider {
    pub fn new(endpoint: &ApiEndpoint) -> Result<Self, AppError> {
        Ok(Self {
            client: http_client(Duration::from_secs(120))?,
            endpoint: endpoint.clone(),
        })
    }
}

#[async_trait]
impl ResearchProvider for DeepResearchProvider {
    fn name(&self) -> &'static str {
        "deep-research"
    }

    async fn research(&self, identity: &ContactIdentity) -> Result<ResearchMaterial, AppError> {
        let url = format!("{}/research", self.endpoint.base_url);
        let query = build_query(identity);
        let email = identity.identity_key();
        let request = DeepResearchRequest {
            query: &query,
            name: identity.full_name.trim(),
            email: &email,
            company: identity.company(),
            anchor: identity.anchor.as_ref().map(|a| a.reference.as_str()),
        };

        let response: DeepResearchResponse = post_json(
            &self.client,
            Capability::Research,
            &url,
            &self.endpoint.api_key,
            &request,
        )
        .await?;

        let mut material = ResearchMaterial::empty();
        for source in response.sources {
            if !source.content.trim().is_empty() {
                material.push(source.url, clip(&source.content));
            }
        }
        material.image = response.image_url;
        Ok(material)
    }

    async fn extract_image(&self, _source: &str) -> Result<Option<String>, AppError> {
        Ok(None)
    }
}
