//! Contact Enrichment Library
//!
//! Enriches lists of people with research-derived, schema-validated attributes:
//! pluggable web research, rate-governed structured extraction, and a store
//! exposing an internal (full) and an external (redacted) projection.
//!
//! # Modules
//!
//! - `api`: HTTP handlers and request/response models.
//! - `core`: Pipeline, batch orchestration, schema and domain models.
//! - `data`: Database bootstrap and storage operations.
//! - `integrations`: Research providers and the structured-generation client.
//! - `obs`: Observability and logging.
//! - `budget`: Run-scoped cost ledger.
//! - `config`: Service and per-run configuration.
//! - `rate_governor`: Per-capability concurrency and spacing limits.
//! - `retry`: Retry with backoff around governed calls.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

// Re-export primary modules for shared use in tests and the binary
pub mod api_models;
pub mod batch;
pub mod budget;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod enrichment;
pub mod errors;
pub mod extractor;
pub mod generation_client;
pub mod handlers;
pub mod models;
pub mod rate_governor;
pub mod research;
pub mod research_blob;
pub mod retry;
pub mod schema;
pub mod services;
