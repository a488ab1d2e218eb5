use crate::errors::{AppError, ResultExt};
use crate::models::{EnrichedContact, ExternalContact, NewEnrichment};
use crate::research_blob::{verify, SealedResearch};
use crate::schema::{AttributeRecord, SECTION_NAMES};
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::OnceLock;

const INTERNAL_COLUMNS: &str = "identity_key, full_name, company, tags, raw_research, \
research_checksum, processed_at, created_at, updated_at, revision";

const EXTERNAL_COLUMNS: &str = "identity_key, full_name, company, created_at, updated_at";

/// Largest page served by one external listing call.
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(sqlx::FromRow)]
struct InternalRow {
    identity_key: String,
    full_name: String,
    company: Option<String>,
    tags: String,
    raw_research: String,
    research_checksum: String,
    processed_at: i64,
    created_at: i64,
    updated_at: i64,
    revision: i64,
}

#[derive(sqlx::FromRow)]
struct ExternalRow {
    identity_key: String,
    full_name: String,
    company: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| AppError::InternalError(format!("stored timestamp {} out of range", micros)))
}

impl InternalRow {
    fn into_contact(self) -> Result<EnrichedContact, AppError> {
        let tags: AttributeRecord = serde_json::from_str(&self.tags)
            .map_err(|e| AppError::InternalError(format!("stored tags for {} unreadable: {}", self.identity_key, e)))?;
        Ok(EnrichedContact {
            processed_at: from_micros(self.processed_at)?,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            identity_key: self.identity_key,
            full_name: self.full_name,
            company: self.company,
            tags,
            raw_research: self.raw_research,
            research_checksum: self.research_checksum,
            revision: self.revision,
        })
    }
}

impl ExternalRow {
    fn into_projection(self) -> Result<ExternalContact, AppError> {
        Ok(ExternalContact {
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            identity_key: self.identity_key,
            display_name: self.full_name,
            company: self.company,
        })
    }
}

/// Result of a conditional upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The write was applied; the stored record as now visible.
    Written(EnrichedContact),
    /// A record processed later than this write is already stored and was kept.
    Superseded,
}

/// Dotted path to an attribute inside the tags document, e.g.
/// `inferred_attributes.interests`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePath {
    segments: Vec<String>,
}

fn segment_regex() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("segment regex is valid"))
}

impl AttributePath {
    pub fn parse(path: &str) -> Result<Self, AppError> {
        let segments: Vec<String> = path.trim().split('.').map(str::to_string).collect();
        if segments.len() < 2 {
            return Err(AppError::BadRequest(format!(
                "attribute path '{}' must name a section and an attribute",
                path
            )));
        }
        if !SECTION_NAMES.contains(&segments[0].as_str()) {
            return Err(AppError::BadRequest(format!("unknown section '{}'", segments[0])));
        }
        if let Some(bad) = segments.iter().find(|s| !segment_regex().is_match(s)) {
            return Err(AppError::BadRequest(format!("invalid path segment '{}'", bad)));
        }
        Ok(Self { segments })
    }

    /// SQLite JSON path, e.g. `$.inferred_attributes.interests`.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.segments.join("."))
    }
}

/// Database storage for enriched contacts and their projections.
#[derive(Clone)]
pub struct EnrichmentStorage {
    pool: SqlitePool,
}

impl EnrichmentStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replaces the record for the identity key in a single statement, unless
    /// the stored record was processed later than this one.
    ///
    /// `updated_at` is store-assigned and strictly increases per key.
    pub async fn upsert(&self, enrichment: &NewEnrichment) -> Result<UpsertOutcome, AppError> {
        let key = enrichment.identity.identity_key();
        let sealed = SealedResearch::seal(&enrichment.material)?;
        let tags = serde_json::to_string(&enrichment.tags)?;
        let now = Utc::now().timestamp_micros();

        let sql = format!(
            r#"
            INSERT INTO enriched_contacts ({cols})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(identity_key) DO UPDATE SET
                full_name = excluded.full_name,
                company = excluded.company,
                tags = excluded.tags,
                raw_research = excluded.raw_research,
                research_checksum = excluded.research_checksum,
                processed_at = excluded.processed_at,
                updated_at = MAX(excluded.updated_at, enriched_contacts.updated_at + 1),
                revision = enriched_contacts.revision + 1
            WHERE excluded.processed_at >= enriched_contacts.processed_at
            RETURNING {cols}
            "#,
            cols = INTERNAL_COLUMNS
        );

        let row = sqlx::query_as::<_, InternalRow>(&sql)
            .bind(&key)
            .bind(enrichment.identity.full_name.trim())
            .bind(enrichment.identity.company())
            .bind(&tags)
            .bind(&sealed.data)
            .bind(&sealed.checksum)
            .bind(enrichment.processed_at.timestamp_micros())
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("upserting enrichment for {}", key))?;

        match row {
            Some(row) => {
                let contact = row.into_contact()?;
                tracing::info!(
                    identity_key = %key,
                    revision = contact.revision,
                    "✓ Stored enrichment"
                );
                Ok(UpsertOutcome::Written(contact))
            }
            None => {
                tracing::warn!(identity_key = %key, "Newer enrichment already stored, write superseded");
                Ok(UpsertOutcome::Superseded)
            }
        }
    }

    /// Full record, with the research blob verified against its checksum.
    pub async fn get_internal(&self, identity_key: &str) -> Result<Option<EnrichedContact>, AppError> {
        let key = identity_key.trim().to_lowercase();
        let row = sqlx::query_as::<_, InternalRow>(&format!(
            "SELECT {} FROM enriched_contacts WHERE identity_key = ?",
            INTERNAL_COLUMNS
        ))
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .context("loading internal projection")?;

        let Some(row) = row else {
            return Ok(None);
        };
        verify(&row.identity_key, &row.raw_research, &row.research_checksum)?;
        row.into_contact().map(Some)
    }

    /// External projection. Only the subset columns are read.
    pub async fn get_external(&self, identity_key: &str) -> Result<Option<ExternalContact>, AppError> {
        let key = identity_key.trim().to_lowercase();
        sqlx::query_as::<_, ExternalRow>(&format!(
            "SELECT {} FROM enriched_contacts WHERE identity_key = ?",
            EXTERNAL_COLUMNS
        ))
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .context("loading external projection")?
        .map(ExternalRow::into_projection)
        .transpose()
    }

    /// One page of external projections ordered by identity key, strictly after `after`.
    pub async fn list_external_page(
        &self,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ExternalContact>, AppError> {
        let rows = sqlx::query_as::<_, ExternalRow>(&format!(
            "SELECT {} FROM enriched_contacts WHERE identity_key > ? ORDER BY identity_key LIMIT ?",
            EXTERNAL_COLUMNS
        ))
        .bind(after.unwrap_or(""))
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(&self.pool)
        .await
        .context("listing external projections")?;

        rows.into_iter().map(ExternalRow::into_projection).collect()
    }

    /// Lazy, restartable walk over every external projection.
    pub fn list_external(&self, page_size: i64) -> ExternalCursor {
        ExternalCursor::resume(self.clone(), None, page_size)
    }

    /// Keys whose attribute at `path` equals `needle` (case-insensitive) or,
    /// for list attributes, contains it. Evaluated inside SQLite.
    pub async fn find_by_attribute(
        &self,
        path: &AttributePath,
        needle: &str,
        limit: i64,
    ) -> Result<Vec<ExternalContact>, AppError> {
        let rows = sqlx::query_as::<_, ExternalRow>(&format!(
            r#"
            SELECT {} FROM enriched_contacts
            WHERE EXISTS (
                SELECT 1 FROM json_each(enriched_contacts.tags, ?)
                WHERE json_each.type = 'text' AND lower(json_each.value) = lower(?)
            )
            ORDER BY identity_key
            LIMIT ?
            "#,
            EXTERNAL_COLUMNS
        ))
        .bind(path.json_path())
        .bind(needle.trim())
        .bind(limit.clamp(1, MAX_PAGE_SIZE))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("filtering by {}", path.json_path()))?;

        rows.into_iter().map(ExternalRow::into_projection).collect()
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enriched_contacts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Keyset cursor over the external projection. Pages never overlap or skip a
/// key that existed for the whole walk; the cursor can be rebuilt from
/// [`ExternalCursor::position`].
pub struct ExternalCursor {
    storage: EnrichmentStorage,
    after: Option<String>,
    page_size: i64,
    exhausted: bool,
}

impl ExternalCursor {
    pub fn resume(storage: EnrichmentStorage, after: Option<String>, page_size: i64) -> Self {
        Self {
            storage,
            after,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            exhausted: false,
        }
    }

    /// Last identity key handed out.
    pub fn position(&self) -> Option<&str> {
        self.after.as_deref()
    }

    /// Next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ExternalContact>>, AppError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .storage
            .list_external_page(self.after.as_deref(), self.page_size)
            .await?;
        if (page.len() as i64) < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after = Some(last.identity_key.clone());
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_path_parsing() {
        let path = AttributePath::parse("inferred_attributes.interests").unwrap();
        assert_eq!(path.json_path(), "$.inferred_attributes.interests");
        assert!(AttributePath::parse("professional_profile.current_role.title").is_ok());

        assert!(AttributePath::parse("inferred_attributes").is_err());
        assert!(AttributePath::parse("horoscope.sign").is_err());
        assert!(AttributePath::parse("inferred_attributes.a') OR 1=1 --").is_err());
        assert!(AttributePath::parse("inferred_attributes..x").is_err());
    }
}
