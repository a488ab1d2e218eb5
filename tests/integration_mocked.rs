/// Integration tests with mocked external APIs
/// Exercises the research providers and the generation client against wiremock
use contact_enrichment::budget::{BudgetConfig, CostLedger};
use contact_enrichment::config::{ApiEndpoint, GenerationSettings};
use contact_enrichment::errors::{AppError, Capability};
use contact_enrichment::extractor::{CallScope, ExtractionSettings, TagExtractor};
use contact_enrichment::generation_client::{
    ChatCompletionsClient, GenerationRequest, StructuredGenerator,
};
use contact_enrichment::models::{ContactIdentity, ResearchMaterial};
use contact_enrichment::rate_governor::{CapabilityLimits, RateGovernor};
use contact_enrichment::research::ResearchProvider;
use contact_enrichment::retry::RetryPolicy;
use contact_enrichment::schema::SECTION_NAMES;
use contact_enrichment::services::{ComposedSearchProvider, DeepResearchProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer, key: &str) -> ApiEndpoint {
    ApiEndpoint {
        base_url: server.uri(),
        api_key: key.to_string(),
    }
}

fn composed(server: &MockServer, max_urls: usize) -> ComposedSearchProvider {
    ComposedSearchProvider::new(
        &endpoint(server, "search_key"),
        &endpoint(server, "extract_key"),
        max_urls,
    )
    .unwrap()
}

fn jane() -> ContactIdentity {
    ContactIdentity::new("Jane Doe", "jane@x.com").with_company("Acme")
}

async fn mount_search(server: &MockServer, results: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(header("authorization", "Bearer search_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_composed_search_extracts_top_pages() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_partial_json(json!({ "query": "\"Jane Doe\" Acme", "num_results": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "url": "https://acme.example/team", "title": "Team" },
                { "url": "https://news.example/jane", "snippet": "Jane Doe joins Acme" },
                { "url": "https://ignored.example" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(header("authorization", "Bearer extract_key"))
        .and(body_partial_json(json!({ "url": "https://acme.example/team" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Jane Doe is the CEO of Acme Corp.",
            "image_url": "https://acme.example/jane.jpg"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(body_partial_json(json!({ "url": "https://news.example/jane" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Acme names Jane Doe chief executive."
        })))
        .mount(&server)
        .await;

    let material = composed(&server, 2).research(&jane()).await.unwrap();

    assert_eq!(material.source_count(), 2);
    assert_eq!(material.entries[0].source, "https://acme.example/team");
    assert_eq!(material.entries[0].text, "Jane Doe is the CEO of Acme Corp.");
    assert_eq!(material.entries[1].source, "https://news.example/jane");
    assert_eq!(material.image.as_deref(), Some("https://acme.example/jane.jpg"));
}

#[tokio::test]
async fn test_failed_page_falls_back_to_snippet() {
    let server = MockServer::start().await;
    mount_search(
        &server,
        json!([{ "url": "https://slow.example", "title": "Jane Doe", "snippet": "CFO at Acme" }]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unsupported page"))
        .mount(&server)
        .await;

    let material = composed(&server, 3).research(&jane()).await.unwrap();

    assert_eq!(material.source_count(), 1);
    assert_eq!(material.entries[0].text, "Jane Doe\nCFO at Acme");
    assert!(material.image.is_none());
}

#[tokio::test]
async fn test_slow_page_falls_back_without_stalling_research() {
    let server = MockServer::start().await;
    mount_search(
        &server,
        json!([
            { "url": "https://slow.example", "title": "Jane Doe", "snippet": "CFO at Acme" },
            { "url": "https://fast.example", "snippet": "unused" }
        ]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(body_partial_json(json!({ "url": "https://slow.example" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "text": "too late" }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .and(body_partial_json(json!({ "url": "https://fast.example" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "Jane Doe profile" })))
        .mount(&server)
        .await;

    let provider = composed(&server, 2).with_page_timeout(Duration::from_millis(200));
    let started = std::time::Instant::now();
    let material = provider.research(&jane()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(material.source_count(), 2);
    assert_eq!(material.entries[0].source, "https://slow.example");
    assert_eq!(material.entries[0].text, "Jane Doe\nCFO at Acme");
    assert_eq!(material.entries[1].text, "Jane Doe profile");
}

#[tokio::test]
async fn test_pages_are_extracted_concurrently() {
    let server = MockServer::start().await;
    let hits: Vec<serde_json::Value> = (0..4)
        .map(|i| json!({ "url": format!("https://page{}.example", i) }))
        .collect();
    mount_search(&server, json!(hits)).await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "text": "page body" }))
                .set_delay(Duration::from_millis(400)),
        )
        .expect(4)
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let material = composed(&server, 4).research(&jane()).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_200));
    let sources: Vec<&str> = material.entries.iter().map(|e| e.source.as_str()).collect();
    assert_eq!(
        sources,
        vec![
            "https://page0.example",
            "https://page1.example",
            "https://page2.example",
            "https://page3.example"
        ]
    );
}

#[tokio::test]
async fn test_no_search_results_is_empty_material() {
    let server = MockServer::start().await;
    mount_search(&server, json!([])).await;

    let material = composed(&server, 3).research(&jane()).await.unwrap();
    assert!(material.is_empty());
}

#[tokio::test]
async fn test_rejected_extraction_key_fails_research() {
    let server = MockServer::start().await;
    mount_search(&server, json!([{ "url": "https://acme.example", "snippet": "x" }])).await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = composed(&server, 3).research(&jane()).await.unwrap_err();
    assert!(err.is_capability_wide());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_search_outage_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = composed(&server, 3).research(&jane()).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Transient {
            capability: Capability::Research,
            ..
        }
    ));
}

#[tokio::test]
async fn test_page_cache_serves_repeat_extracts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "cached page",
            "image_url": "https://acme.example/logo.png"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = composed(&server, 3);
    let first = provider.extract_page("https://acme.example").await.unwrap();
    let second = provider.extract_page("https://acme.example").await.unwrap();
    assert_eq!(first.text, second.text);

    let image = provider.extract_image("https://acme.example").await.unwrap();
    assert_eq!(image.as_deref(), Some("https://acme.example/logo.png"));
}

#[tokio::test]
async fn test_deep_research_single_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/research"))
        .and(header("authorization", "Bearer deep_key"))
        .and(body_partial_json(json!({
            "name": "Jane Doe",
            "email": "jane@x.com",
            "company": "Acme"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sources": [
                { "url": "https://acme.example/team", "content": "Jane Doe, CEO" },
                { "url": "https://empty.example", "content": "   " }
            ],
            "image_url": "https://acme.example/jane.jpg"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = DeepResearchProvider::new(&endpoint(&server, "deep_key")).unwrap();
    let material = provider.research(&jane()).await.unwrap();

    assert_eq!(material.source_count(), 1);
    assert_eq!(material.entries[0].text, "Jane Doe, CEO");
    assert_eq!(material.image.as_deref(), Some("https://acme.example/jane.jpg"));
    assert_eq!(provider.extract_image("https://acme.example/team").await.unwrap(), None);
}

fn generation_client(server: &MockServer) -> ChatCompletionsClient {
    ChatCompletionsClient::new(&GenerationSettings {
        base_url: format!("{}/v1/", server.uri()),
        api_key: "llm_key".to_string(),
        model: "test-model".to_string(),
    })
    .unwrap()
}

fn generation_request() -> GenerationRequest {
    GenerationRequest {
        system: "Extract attributes.".to_string(),
        prompt: "Jane Doe is the CEO of Acme Corp.".to_string(),
        schema: json!({ "type": "object" }),
    }
}

#[tokio::test]
async fn test_generation_returns_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer llm_key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "{\"metadata\":{}}" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let content = generation_client(&server)
        .generate(&generation_request())
        .await
        .unwrap();
    assert_eq!(content, "{\"metadata\":{}}");
}

#[tokio::test]
async fn test_generation_empty_content_is_schema_violation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = generation_client(&server)
        .generate(&generation_request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SchemaViolation(_)));
}

#[tokio::test]
async fn test_generation_status_classification() {
    let cases = [
        (429, "transient"),
        (500, "transient"),
        (401, "permanent"),
        (403, "permanent"),
        (400, "request"),
    ];

    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = generation_client(&server)
            .generate(&generation_request())
            .await
            .unwrap_err();
        let actual = match err {
            AppError::Transient {
                capability: Capability::Extraction,
                ..
            } => "transient",
            AppError::Permanent {
                capability: Capability::Extraction,
                ..
            } => "permanent",
            AppError::ExternalApiError {
                capability: Capability::Extraction,
                ..
            } => "request",
            other => panic!("unexpected error for {}: {}", status, other),
        };
        assert_eq!(actual, expected, "status {}", status);
    }
}

#[tokio::test]
async fn test_empty_completion_then_valid_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "  " } }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let mut record = serde_json::Map::new();
    for name in SECTION_NAMES {
        record.insert(name.to_string(), json!({}));
    }
    record.insert("professional_profile".to_string(), json!({ "title": "CEO" }));
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": serde_json::Value::Object(record).to_string()
            } }]
        })))
        .mount(&server)
        .await;

    let governor = RateGovernor::new(&CapabilityLimits::new(1, None), &CapabilityLimits::new(1, None));
    let ledger = CostLedger::new(&BudgetConfig::default());
    let cancel = CancellationToken::new();
    let scope = CallScope {
        governor: &governor,
        ledger: &ledger,
        cancel: &cancel,
    };
    let settings = ExtractionSettings {
        validation_attempts: 3,
        retry: RetryPolicy::new(3, 200, 2_000),
        timeout: Duration::from_secs(5),
        max_prompt_chars: 4_000,
    };
    let mut material = ResearchMaterial::empty();
    material.push("https://acme.example/team", "Jane Doe is CEO of Acme");

    let extraction = TagExtractor::new(Arc::new(generation_client(&server)))
        .extract(&material, &jane(), &settings, &scope)
        .await
        .unwrap();

    assert_eq!(extraction.attempts, 2);
    assert_eq!(
        extraction.record.professional_profile["title"].as_text(),
        Some("CEO")
    );
}
