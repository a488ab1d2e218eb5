use crate::errors::{AppError, Capability};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Estimated per-call costs and an optional ceiling for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Hard ceiling in USD; `None` means unlimited.
    #[serde(default)]
    pub limit_usd: Option<f64>,
    /// Search plus page extraction for one contact.
    #[serde(default = "default_research_call_usd")]
    pub research_call_usd: f64,
    /// One structured-generation call.
    #[serde(default = "default_extraction_call_usd")]
    pub extraction_call_usd: f64,
}

fn default_research_call_usd() -> f64 {
    0.017
}

fn default_extraction_call_usd() -> f64 {
    0.002
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_usd: None,
            research_call_usd: default_research_call_usd(),
            extraction_call_usd: default_extraction_call_usd(),
        }
    }
}

fn to_micros(usd: f64) -> u64 {
    (usd.max(0.0) * MICROS_PER_USD).round() as u64
}

/// Totals reported with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub research_usd: f64,
    pub extraction_usd: f64,
    pub contacts_charged: u64,
    pub limit_usd: Option<f64>,
}

/// Run-scoped spend tracker. Charges are refused, not recorded, when they would
/// cross the limit.
#[derive(Debug)]
pub struct CostLedger {
    limit_micros: Option<u64>,
    research_micros: u64,
    extraction_micros: u64,
    spent: AtomicU64,
    research_spent: AtomicU64,
    extraction_spent: AtomicU64,
    contacts: AtomicU64,
}

impl CostLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            limit_micros: config.limit_usd.map(to_micros),
            research_micros: to_micros(config.research_call_usd),
            extraction_micros: to_micros(config.extraction_call_usd),
            spent: AtomicU64::new(0),
            research_spent: AtomicU64::new(0),
            extraction_spent: AtomicU64::new(0),
            contacts: AtomicU64::new(0),
        }
    }

    /// Reserves the cost of one call to `capability`.
    pub fn charge(&self, capability: Capability) -> Result<(), AppError> {
        let cost = match capability {
            Capability::Research => self.research_micros,
            Capability::Extraction => self.extraction_micros,
        };

        let reserved = self
            .spent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |spent| {
                let next = spent.saturating_add(cost);
                match self.limit_micros {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });

        if let Err(spent) = reserved {
            let limit = self.limit_micros.unwrap_or_default() as f64 / MICROS_PER_USD;
            return Err(AppError::BudgetExceeded(format!(
                "{} call would raise spend from ${:.3} past the ${:.2} limit",
                capability,
                spent as f64 / MICROS_PER_USD,
                limit
            )));
        }

        match capability {
            Capability::Research => {
                self.research_spent.fetch_add(cost, Ordering::SeqCst);
                self.contacts.fetch_add(1, Ordering::SeqCst);
            }
            Capability::Extraction => {
                self.extraction_spent.fetch_add(cost, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> CostSummary {
        CostSummary {
            total_usd: self.spent.load(Ordering::SeqCst) as f64 / MICROS_PER_USD,
            research_usd: self.research_spent.load(Ordering::SeqCst) as f64 / MICROS_PER_USD,
            extraction_usd: self.extraction_spent.load(Ordering::SeqCst) as f64 / MICROS_PER_USD,
            contacts_charged: self.contacts.load(Ordering::SeqCst),
            limit_usd: self.limit_micros.map(|m| m as f64 / MICROS_PER_USD),
        }
    }
}
