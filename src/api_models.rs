use crate::config::RunConfig;
use crate::models::{ContactIdentity, ExternalContact};
use serde::{Deserialize, Serialize};

/// Largest batch accepted in one request.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Body of `POST /api/v1/batches`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub contacts: Vec<ContactIdentity>,
    /// Overrides the service defaults for this run.
    #[serde(default)]
    pub config: Option<RunConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    /// Identity key of the last item of the previous page.
    pub after: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    /// Dotted attribute path, e.g. `inferred_attributes.interests`.
    pub path: String,
    pub contains: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactPage {
    pub items: Vec<ExternalContact>,
    /// Pass as `after` to fetch the next page; absent on the last page.
    pub next_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub path: String,
    pub contains: String,
    pub items: Vec<ExternalContact>,
}
