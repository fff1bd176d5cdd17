//! Per-entity and batch orchestration.
//!
//! Within one entity every fiscal year is handled in order: cash-flow
//! normalization for the year is committed before any Q4 of that year is
//! derived. Entities share nothing, so a batch hands whole entities to a
//! fixed pool of workers.

use crate::classifier::ConceptClassifier;
use crate::config::ReconcilerConfig;
use crate::deriver::{DerivationRecord, Period4Deriver, RecordStatus};
use crate::error::Result;
use crate::normalizer::{CumulativeNormalizer, NormalizationSummary};
use crate::schema::{Cadence, ConceptDefinition, EntityId, StatementCategory};
use crate::store::{ConceptFilter, FilingStore};
use crossbeam::channel;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Restrict the run to these fiscal years; empty means every year on file.
    pub fiscal_years: Vec<i32>,
    /// Delete previously derived values before deriving again.
    pub recalculate: bool,
}

impl RunOptions {
    pub fn fiscal_year(mut self, fiscal_year: i32) -> Self {
        self.fiscal_years.push(fiscal_year);
        self
    }

    pub fn recalculate(mut self, recalculate: bool) -> Self {
        self.recalculate = recalculate;
        self
    }

    fn includes(&self, fiscal_year: i32) -> bool {
        self.fiscal_years.is_empty() || self.fiscal_years.contains(&fiscal_year)
    }
}

/// Cooperative cancellation shared between the caller and batch workers.
/// Workers check it before picking up the next entity, never mid-entity.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Blocks until `path` exists or `done` is closed, checking every `poll`.
    /// Returns true when the file requested the stop.
    pub fn watch_file(&self, path: &Path, poll: Duration, done: &channel::Receiver<()>) -> bool {
        loop {
            if path.exists() {
                info!("Stop requested through {}", path.display());
                self.stop();
                return true;
            }
            match done.recv_timeout(poll) {
                Err(channel::RecvTimeoutError::Timeout) => continue,
                _ => return false,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub statement: StatementCategory,
    pub processed: usize,
    pub derived: usize,
    pub skipped: usize,
    pub errors: usize,
    pub fallback_matches: usize,
    pub deleted_before_run: usize,
    pub records: Vec<DerivationRecord>,
}

impl CategoryReport {
    fn new(statement: StatementCategory) -> Self {
        Self {
            statement,
            processed: 0,
            derived: 0,
            skipped: 0,
            errors: 0,
            fallback_matches: 0,
            deleted_before_run: 0,
            records: Vec::new(),
        }
    }

    fn push(&mut self, record: DerivationRecord) {
        self.processed += 1;
        match record.status {
            RecordStatus::Derived => self.derived += 1,
            RecordStatus::Skipped => self.skipped += 1,
            RecordStatus::Error => self.errors += 1,
        }
        if record.resolver_tier_used.is_some_and(|t| t.is_fallback()) {
            self.fallback_matches += 1;
        }
        self.records.push(record);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity: EntityId,
    pub fiscal_years: Vec<i32>,
    pub normalization: Option<NormalizationSummary>,
    pub categories: Vec<CategoryReport>,
    /// Set when the entity could not be processed at all.
    pub error: Option<String>,
}

impl EntityReport {
    fn new(entity: &EntityId) -> Self {
        Self {
            entity: entity.clone(),
            fiscal_years: Vec::new(),
            normalization: None,
            categories: Vec::new(),
            error: None,
        }
    }

    fn failed(mut self, details: String) -> Self {
        warn!("Entity {} not processed: {}", self.entity, details);
        self.error = Some(details);
        self
    }

    pub fn category(&self, statement: StatementCategory) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.statement == statement)
    }

    pub fn derived(&self) -> usize {
        self.categories.iter().map(|c| c.derived).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.error.is_some()
            || self.categories.iter().any(|c| c.errors > 0)
            || self
                .normalization
                .as_ref()
                .is_some_and(|n| !n.errors.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchTotals {
    pub entities: usize,
    pub entities_failed: usize,
    pub processed: usize,
    pub derived: usize,
    pub skipped: usize,
    pub errors: usize,
    pub fallback_matches: usize,
    pub q2_fixed: usize,
    pub q3_fixed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub entities: Vec<EntityReport>,
    /// Entities left untouched because the run was stopped.
    pub not_started: Vec<EntityId>,
    pub stopped: bool,
}

impl BatchReport {
    pub fn totals(&self) -> BatchTotals {
        let mut totals = BatchTotals {
            entities: self.entities.len(),
            ..Default::default()
        };
        for entity in &self.entities {
            if entity.error.is_some() {
                totals.entities_failed += 1;
            }
            if let Some(n) = &entity.normalization {
                totals.q2_fixed += n.q2_fixed;
                totals.q3_fixed += n.q3_fixed;
            }
            for c in &entity.categories {
                totals.processed += c.processed;
                totals.derived += c.derived;
                totals.skipped += c.skipped;
                totals.errors += c.errors;
                totals.fallback_matches += c.fallback_matches;
            }
        }
        totals
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct ReconciliationRunner<'a, S: FilingStore + ?Sized> {
    store: &'a S,
    config: &'a ReconcilerConfig,
    classifier: ConceptClassifier,
}

impl<'a, S: FilingStore + ?Sized> ReconciliationRunner<'a, S> {
    pub fn new(store: &'a S, config: &'a ReconcilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            classifier: ConceptClassifier::new(&config.patterns),
        })
    }

    /// Every entity that has data in at least one configured category.
    pub fn discover_entities(&self) -> Result<Vec<EntityId>> {
        let mut entities = BTreeSet::new();
        for &statement in &self.config.statements {
            entities.extend(self.store.list_entities_with_category(statement)?);
        }
        Ok(entities.into_iter().collect())
    }

    /// Never fails: problems are reported inside the [`EntityReport`].
    pub fn run_entity(&self, entity: &EntityId, options: &RunOptions) -> EntityReport {
        let mut report = EntityReport::new(entity);
        let mut categories: Vec<CategoryReport> = self
            .config
            .statements
            .iter()
            .map(|&s| CategoryReport::new(s))
            .collect();

        if options.recalculate {
            for category in &mut categories {
                match self.store.delete_derived_values(entity, category.statement) {
                    Ok(deleted) => category.deleted_before_run = deleted,
                    Err(e) => {
                        return report.failed(format!(
                            "could not clear derived {} values: {}",
                            category.statement, e
                        ))
                    }
                }
            }
        }

        let plan = match self.plan(entity, options) {
            Ok(plan) => plan,
            Err(e) => return report.failed(e.to_string()),
        };
        report.fiscal_years = plan.fiscal_years.clone();

        info!(
            "Reconciling {}: {} fiscal years, {} categories",
            entity,
            plan.fiscal_years.len(),
            categories.len()
        );

        let normalizer =
            CumulativeNormalizer::new(self.store).force(self.config.force_renormalize);
        let deriver = Period4Deriver::new(self.store, &self.classifier);
        let mut normalization = NormalizationSummary::default();

        for &fiscal_year in &plan.fiscal_years {
            if self.config.normalize_cash_flows && plan.cash_flow_years.contains(&fiscal_year) {
                match normalizer.normalize_fiscal_year(entity, fiscal_year) {
                    Ok(summary) => normalization.merge(summary),
                    Err(e) => normalization
                        .errors
                        .push(format!("FY{}: {}", fiscal_year, e)),
                }
            }

            for (category, concepts) in categories.iter_mut().zip(&plan.concepts) {
                for concept in concepts {
                    category.push(deriver.derive(concept, fiscal_year));
                }
            }
        }

        if self.config.normalize_cash_flows {
            report.normalization = Some(normalization);
        }
        for category in &categories {
            info!(
                "{} {}: {} processed, {} derived, {} skipped, {} errors, {} fallback matches",
                entity,
                category.statement,
                category.processed,
                category.derived,
                category.skipped,
                category.errors,
                category.fallback_matches
            );
        }
        report.categories = categories;
        report
    }

    /// Processes entities on `config.workers` threads. Each worker finishes
    /// its current entity before honouring `stop`.
    pub fn run_batch(
        &self,
        entities: &[EntityId],
        options: &RunOptions,
        stop: &StopToken,
    ) -> BatchReport {
        let workers = self.config.workers.min(entities.len()).max(1);
        let (job_tx, job_rx) = channel::bounded::<(usize, &EntityId)>(entities.len().max(1));
        let (result_tx, result_rx) = channel::unbounded::<(usize, EntityReport)>();

        for job in entities.iter().enumerate() {
            // Capacity equals the job count and the receiver is alive.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        info!("Starting batch over {} entities with {} workers", entities.len(), workers);

        let scope_result = crossbeam::thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move |_| {
                    for (idx, entity) in job_rx.iter() {
                        if stop.is_stopped() {
                            debug!("Worker {} stopping before {}", worker, entity);
                            break;
                        }
                        let report = self.run_entity(entity, options);
                        if result_tx.send((idx, report)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut finished: Vec<(usize, EntityReport)> = result_rx.iter().collect();
        finished.sort_by_key(|(idx, _)| *idx);

        let done: BTreeSet<usize> = finished.iter().map(|(idx, _)| *idx).collect();
        let mut report = BatchReport {
            entities: finished.into_iter().map(|(_, r)| r).collect(),
            not_started: entities
                .iter()
                .enumerate()
                .filter(|(idx, _)| !done.contains(idx))
                .map(|(_, e)| e.clone())
                .collect(),
            stopped: stop.is_stopped(),
        };

        if scope_result.is_err() {
            warn!("A batch worker panicked; its remaining entities were not processed");
            report.stopped = true;
        }

        let totals = report.totals();
        info!(
            "Batch finished: {} entities ({} failed, {} not started), {} Q4 values derived, {} skipped, {} errors",
            totals.entities,
            totals.entities_failed,
            report.not_started.len(),
            totals.derived,
            totals.skipped,
            totals.errors
        );
        report
    }

    fn plan(&self, entity: &EntityId, options: &RunOptions) -> Result<EntityPlan> {
        let mut years = BTreeSet::new();
        let mut concepts = Vec::with_capacity(self.config.statements.len());
        for &statement in &self.config.statements {
            years.extend(self.store.list_fiscal_years(entity, statement)?);
            concepts.push(self.store.find_concept_definitions(
                entity,
                statement,
                Cadence::Quarterly,
                &ConceptFilter::all(),
            )?);
        }

        let cash_flow_years: BTreeSet<i32> = if self.config.normalize_cash_flows {
            self.store
                .list_fiscal_years(entity, StatementCategory::CashFlows)?
                .into_iter()
                .collect()
        } else {
            BTreeSet::new()
        };
        years.extend(cash_flow_years.iter().copied());

        Ok(EntityPlan {
            fiscal_years: years.into_iter().filter(|&y| options.includes(y)).collect(),
            cash_flow_years,
            concepts,
        })
    }
}

struct EntityPlan {
    fiscal_years: Vec<i32>,
    cash_flow_years: BTreeSet<i32>,
    /// Quarterly concepts, one list per configured category.
    concepts: Vec<Vec<ConceptDefinition>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deriver::SkipReason;
    use crate::schema::{FiscalPeriod, ValueTransform};
    use crate::store::MemoryStore;
    use crate::test_support::Fixture;

    fn cash_flow_fixture(entity: &str) -> (Fixture, ConceptDefinition) {
        let mut fx = Fixture::new(entity);
        let (q, a) = fx.concept_pair(
            StatementCategory::CashFlows,
            "us-gaap:NetCashProvidedByUsedInOperatingActivities",
            "Net cash from operations",
        );
        fx.value(&q, 2023, FiscalPeriod::Q1, 100.0);
        fx.value(&q, 2023, FiscalPeriod::Q2, 250.0);
        fx.value(&q, 2023, FiscalPeriod::Q3, 400.0);
        fx.value(&a, 2023, FiscalPeriod::FY, 600.0);
        (fx, q)
    }

    #[test]
    fn test_normalizes_before_deriving() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        let report = runner.run_entity(&fx.entity, &RunOptions::default());

        assert!(!report.has_errors());
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q2), Some(150.0));
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q3), Some(150.0));
        // 600 - (100 + 150 + 150), not 600 - (100 + 250 + 400)
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), Some(200.0));

        assert_eq!(report.category(StatementCategory::CashFlows).unwrap().derived, 1);
        let normalization = report.normalization.as_ref().unwrap();
        assert_eq!(normalization.q2_fixed, 1);
        assert_eq!(normalization.q3_fixed, 1);
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        runner.run_entity(&fx.entity, &RunOptions::default());
        let before = fx.store.snapshot().unwrap().values;
        let second = runner.run_entity(&fx.entity, &RunOptions::default());

        let category = second.category(StatementCategory::CashFlows).unwrap();
        assert_eq!(category.derived, 0);
        assert!(category
            .records
            .iter()
            .all(|r| r.skip == Some(SkipReason::AlreadyExists)));
        assert_eq!(second.normalization.as_ref().unwrap().already_normalized, 2);
        assert_eq!(fx.store.snapshot().unwrap().values, before);
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), Some(200.0));
    }

    #[test]
    fn test_recalculate_replaces_derived_values() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();
        runner.run_entity(&fx.entity, &RunOptions::default());

        let annual = fx
            .store
            .snapshot()
            .unwrap()
            .values
            .into_iter()
            .find(|v| v.cadence == Cadence::Annual)
            .unwrap();
        fx.store
            .update_value(annual.id, 700.0, ValueTransform::AsFiled)
            .unwrap();

        let report = runner.run_entity(&fx.entity, &RunOptions::default().recalculate(true));
        let category = report.category(StatementCategory::CashFlows).unwrap();
        assert_eq!(category.deleted_before_run, 1);
        assert_eq!(category.derived, 1);
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), Some(300.0));
    }

    #[test]
    fn test_fiscal_year_filter() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        let report = runner.run_entity(&fx.entity, &RunOptions::default().fiscal_year(2022));
        assert!(report.fiscal_years.is_empty());
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q2), Some(250.0));
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), None);
    }

    #[test]
    fn test_normalization_can_be_disabled() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig {
            normalize_cash_flows: false,
            ..Default::default()
        };
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        let report = runner.run_entity(&fx.entity, &RunOptions::default());
        assert!(report.normalization.is_none());
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), Some(-150.0));
    }

    #[test]
    fn test_batch_processes_every_entity() {
        let store = MemoryStore::new();
        let mut entities = Vec::new();
        for cik in ["0000000001", "0000000002", "0000000003"] {
            let (fx, _) = cash_flow_fixture(cik);
            let snapshot = fx.store.snapshot().unwrap();
            for concept in snapshot.concepts {
                // Fixture ids restart per entity; keep them unique here.
                let offset = entities.len() as u64 * 100;
                let mut concept = concept;
                concept.id = crate::schema::ConceptId(concept.id.0 + offset);
                store.add_concept(concept).unwrap();
            }
            for mut value in snapshot.values {
                let offset = entities.len() as u64 * 100;
                value.concept_id = crate::schema::ConceptId(value.concept_id.0 + offset);
                value.id = crate::schema::ValueId(value.id.0 + offset);
                store.add_value(value).unwrap();
            }
            entities.push(fx.entity.clone());
        }

        let config = ReconcilerConfig {
            workers: 2,
            ..Default::default()
        };
        let runner = ReconciliationRunner::new(&store, &config).unwrap();
        assert_eq!(runner.discover_entities().unwrap(), entities);

        let report = runner.run_batch(&entities, &RunOptions::default(), &StopToken::new());
        assert!(!report.stopped);
        assert!(report.not_started.is_empty());
        let ordered: Vec<EntityId> = report.entities.iter().map(|e| e.entity.clone()).collect();
        assert_eq!(ordered, entities);

        let totals = report.totals();
        assert_eq!(totals.derived, 3);
        assert_eq!(totals.q2_fixed, 3);
        assert_eq!(totals.errors, 0);
    }

    #[test]
    fn test_stopped_batch_leaves_entities_untouched() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        let stop = StopToken::new();
        stop.stop();
        let report = runner.run_batch(&[fx.entity.clone()], &RunOptions::default(), &stop);

        assert!(report.stopped);
        assert!(report.entities.is_empty());
        assert_eq!(report.not_started, vec![fx.entity.clone()]);
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q2), Some(250.0));
    }

    #[test]
    fn test_stop_file_stops_batch() {
        let (fx, q) = cash_flow_fixture("0000789019");
        let config = ReconcilerConfig::default();
        let runner = ReconciliationRunner::new(&fx.store, &config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("STOP");
        let stop = StopToken::new();
        let watcher = stop.clone();
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        std::fs::write(&path, b"").unwrap();
        assert!(watcher.watch_file(&path, Duration::from_millis(5), &done_rx));
        drop(done_tx);

        let report = runner.run_batch(&[fx.entity.clone()], &RunOptions::default(), &stop);
        assert!(report.stopped);
        assert_eq!(report.not_started, vec![fx.entity.clone()]);
        assert_eq!(fx.amount(&q, 2023, FiscalPeriod::Q4), None);
    }

    #[test]
    fn test_watcher_exits_when_batch_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopToken::new();
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        drop(done_tx);

        assert!(!stop.watch_file(&dir.path().join("STOP"), Duration::from_millis(5), &done_rx));
        assert!(!stop.is_stopped());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = MemoryStore::new();
        let config = ReconcilerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(ReconciliationRunner::new(&store, &config).is_err());
    }
}
