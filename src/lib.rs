//! # Filing Period Reconciler
//!
//! Reconciles quarterly (10-Q) and annual (10-K) filings of the same entity
//! into a gap-free quarterly series.
//!
//! ## Core Concepts
//!
//! - **Flow concepts**: activity over a period (revenue, operating cash flow). The missing
//!   fourth quarter is `Annual - (Q1 + Q2 + Q3)`
//! - **Point-in-time concepts**: snapshots at a date (cash balance, shares outstanding). The
//!   fourth quarter equals the annual figure
//! - **Cadence**: quarterly and annual filings carry separate concept populations; the
//!   resolver matches them up, using the parent line item for dimensional breakdowns
//! - **Cumulative cash flows**: Q2/Q3 cash-flow figures filed year-to-date are rewritten into
//!   discrete quarters before any Q4 is derived
//!
//! ## Example
//!
//! ```rust,ignore
//! use filing_period_reconciler::*;
//!
//! let store = MemoryStore::load_json("filings.json")?;
//! let config = ReconcilerConfig::default();
//!
//! let report = reconcile_entity(&store, &config, &EntityId::new("0000320193"))?;
//! println!("derived {} Q4 values", report.derived());
//!
//! store.save_json("filings.json")?;
//! ```

pub mod audit;
pub mod classifier;
pub mod config;
pub mod deriver;
pub mod error;
pub mod materializer;
pub mod normalizer;
pub mod resolver;
pub mod runner;
pub mod schema;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use audit::{AuditFinding, AuditReport, FindingKind, SeriesAuditor, DEFAULT_AUDIT_TOLERANCE};
pub use classifier::{ConceptClass, ConceptClassifier, PatternTable};
pub use config::ReconcilerConfig;
pub use deriver::{DerivationRecord, Period4Deriver, RecordStatus, SkipReason};
pub use error::{ReconcileError, Result};
pub use materializer::{
    DerivationMethod, DerivedValueMaterializer, DerivedValueRequest, MaterializeOutcome,
    DERIVED_DATA_SOURCE,
};
pub use normalizer::{CumulativeNormalizer, NormalizationSummary};
pub use resolver::{ConceptResolver, Resolution, ResolverTier};
pub use runner::{
    BatchReport, BatchTotals, CategoryReport, EntityReport, ReconciliationRunner, RunOptions,
    StopToken,
};
pub use schema::*;
pub use store::{ConceptFilter, FilingStore, MemoryStore};

use log::{debug, info};

pub struct FilingReconciler;

impl FilingReconciler {
    pub fn process<S: FilingStore + ?Sized>(
        store: &S,
        config: &ReconcilerConfig,
        entity: &EntityId,
        options: &RunOptions,
    ) -> Result<EntityReport> {
        let runner = ReconciliationRunner::new(store, config)?;
        let report = runner.run_entity(entity, options);

        if let Some(error) = &report.error {
            return Err(ReconcileError::Storage {
                entity: entity.clone(),
                details: error.clone(),
            });
        }
        for category in &report.categories {
            for record in category.records.iter().filter(|r| r.is_error()) {
                debug!(
                    "Error record for {} FY{}: {}",
                    record.concept,
                    record.fiscal_year,
                    record.reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        Ok(report)
    }

    /// Runs the entity, then re-checks every derived series against its
    /// annual source within `config.audit_tolerance`.
    pub fn process_with_verification<S: FilingStore + ?Sized>(
        store: &S,
        config: &ReconcilerConfig,
        entity: &EntityId,
        options: &RunOptions,
    ) -> Result<EntityReport> {
        let report = Self::process(store, config, entity, options)?;

        let classifier = ConceptClassifier::new(&config.patterns);
        let auditor = SeriesAuditor::new(store, &classifier, config.audit_tolerance)?;
        for &statement in &config.statements {
            auditor.verify_entity(entity, statement)?;
        }

        Ok(report)
    }

    /// Every entity with data in a configured category, processed on
    /// `config.workers` threads.
    pub fn process_all<S: FilingStore + ?Sized>(
        store: &S,
        config: &ReconcilerConfig,
        options: &RunOptions,
        stop: &StopToken,
    ) -> Result<BatchReport> {
        let runner = ReconciliationRunner::new(store, config)?;
        let entities = runner.discover_entities()?;
        info!(
            "Found {} entities with {} data",
            entities.len(),
            config
                .statements
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("/")
        );
        Ok(runner.run_batch(&entities, options, stop))
    }
}

pub fn reconcile_entity<S: FilingStore + ?Sized>(
    store: &S,
    config: &ReconcilerConfig,
    entity: &EntityId,
) -> Result<EntityReport> {
    FilingReconciler::process(store, config, entity, &RunOptions::default())
}

pub fn reconcile_with_verification<S: FilingStore + ?Sized>(
    store: &S,
    config: &ReconcilerConfig,
    entity: &EntityId,
) -> Result<EntityReport> {
    FilingReconciler::process_with_verification(store, config, entity, &RunOptions::default())
}

pub fn reconcile_all<S: FilingStore + ?Sized>(
    store: &S,
    config: &ReconcilerConfig,
) -> Result<BatchReport> {
    FilingReconciler::process_all(store, config, &RunOptions::default(), &StopToken::new())
}
