//! Rewrites year-to-date cumulative cash-flow figures filed for Q2 (six
//! months) and Q3 (nine months) into discrete quarterly amounts.
//!
//! Q2 = Q2_cumulative - Q1 and Q3 = Q3_cumulative - Q2_cumulative. Both
//! corrections read from a snapshot taken before the first write, so the Q3
//! correction always sees the cumulative Q2 figure.
//!
//! Rewritten records are stamped [`ValueTransform::DiscreteFromCumulative`] and
//! skipped on later runs. `force` mode ignores the stamp and reproduces the
//! unguarded transform: running it on already-normalized data corrupts Q2/Q3
//! a second time.

use crate::error::Result;
use crate::schema::{
    Cadence, ConceptDefinition, DataValue, EntityId, FiscalPeriod, StatementCategory,
    ValueTransform,
};
use crate::store::{ConceptFilter, FilingStore};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSummary {
    pub fiscal_years_processed: usize,
    pub q2_fixed: usize,
    pub q3_fixed: usize,
    pub q2_skipped: usize,
    pub q3_skipped: usize,
    pub already_normalized: usize,
    pub errors: Vec<String>,
}

impl NormalizationSummary {
    pub fn merge(&mut self, other: NormalizationSummary) {
        self.fiscal_years_processed += other.fiscal_years_processed;
        self.q2_fixed += other.q2_fixed;
        self.q3_fixed += other.q3_fixed;
        self.q2_skipped += other.q2_skipped;
        self.q3_skipped += other.q3_skipped;
        self.already_normalized += other.already_normalized;
        self.errors.extend(other.errors);
    }
}

struct QuarterSnapshot {
    concept: ConceptDefinition,
    q1: Option<DataValue>,
    q2: Option<DataValue>,
    q3: Option<DataValue>,
}

pub struct CumulativeNormalizer<'a, S: FilingStore + ?Sized> {
    store: &'a S,
    force: bool,
}

impl<'a, S: FilingStore + ?Sized> CumulativeNormalizer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            force: false,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn normalize_entity(&self, entity: &EntityId) -> NormalizationSummary {
        let mut summary = NormalizationSummary::default();

        let fiscal_years = match self
            .store
            .list_fiscal_years(entity, StatementCategory::CashFlows)
        {
            Ok(years) => years,
            Err(e) => {
                summary
                    .errors
                    .push(format!("Entity {}: could not list fiscal years: {}", entity, e));
                return summary;
            }
        };

        for fiscal_year in fiscal_years {
            match self.normalize_fiscal_year(entity, fiscal_year) {
                Ok(year) => summary.merge(year),
                Err(e) => summary.errors.push(format!(
                    "Entity {} FY{}: cash-flow normalization aborted before any write: {}",
                    entity, fiscal_year, e
                )),
            }
        }

        info!(
            "Normalized cash flows for {}: Q2 fixed {}, Q3 fixed {}, skipped {}/{}, already normalized {}",
            entity,
            summary.q2_fixed,
            summary.q3_fixed,
            summary.q2_skipped,
            summary.q3_skipped,
            summary.already_normalized
        );
        summary
    }

    /// Read failures abort the year before anything is written. Write
    /// failures are recorded per record and the pass continues.
    pub fn normalize_fiscal_year(
        &self,
        entity: &EntityId,
        fiscal_year: i32,
    ) -> Result<NormalizationSummary> {
        let snapshot = self.take_snapshot(entity, fiscal_year)?;
        let mut summary = NormalizationSummary {
            fiscal_years_processed: 1,
            ..Default::default()
        };

        debug!(
            "FY{} of {}: snapshot holds {} cash-flow concepts with Q1-Q3 data",
            fiscal_year,
            entity,
            snapshot.len()
        );

        for entry in &snapshot {
            self.fix_q2(entity, fiscal_year, entry, &mut summary);
            self.fix_q3(entity, fiscal_year, entry, &mut summary);
        }

        Ok(summary)
    }

    fn take_snapshot(&self, entity: &EntityId, fiscal_year: i32) -> Result<Vec<QuarterSnapshot>> {
        let concepts = self.store.find_concept_definitions(
            entity,
            StatementCategory::CashFlows,
            Cadence::Quarterly,
            &ConceptFilter::all(),
        )?;

        let mut snapshot = Vec::with_capacity(concepts.len());
        for concept in concepts {
            let q1 = self.sourced(entity, &concept, fiscal_year, FiscalPeriod::Q1)?;
            let q2 = self.sourced(entity, &concept, fiscal_year, FiscalPeriod::Q2)?;
            let q3 = self.sourced(entity, &concept, fiscal_year, FiscalPeriod::Q3)?;
            if q2.is_none() && q3.is_none() {
                continue;
            }
            snapshot.push(QuarterSnapshot {
                concept,
                q1,
                q2,
                q3,
            });
        }
        Ok(snapshot)
    }

    fn sourced(
        &self,
        entity: &EntityId,
        concept: &ConceptDefinition,
        fiscal_year: i32,
        period: FiscalPeriod,
    ) -> Result<Option<DataValue>> {
        Ok(self
            .store
            .find_value(entity, concept.id, fiscal_year, period)?
            .filter(|v| !v.derived))
    }

    fn is_marked(&self, value: &DataValue) -> bool {
        !self.force && value.transform == ValueTransform::DiscreteFromCumulative
    }

    fn fix_q2(
        &self,
        entity: &EntityId,
        fiscal_year: i32,
        entry: &QuarterSnapshot,
        summary: &mut NormalizationSummary,
    ) {
        let Some(q2) = &entry.q2 else {
            return;
        };
        if self.is_marked(q2) {
            summary.already_normalized += 1;
            return;
        }
        let Some(q1) = &entry.q1 else {
            summary.q2_skipped += 1;
            debug!(
                "Skipped Q2 for {} FY{} of {}: no Q1 value",
                entry.concept.concept, fiscal_year, entity
            );
            return;
        };

        let discrete = q2.value - q1.value;
        match self
            .store
            .update_value(q2.id, discrete, ValueTransform::DiscreteFromCumulative)
        {
            Ok(()) => {
                summary.q2_fixed += 1;
                debug!(
                    "Fixed Q2 for {} FY{}: {:.2} -> {:.2} (Q2 - Q1)",
                    entry.concept.concept, fiscal_year, q2.value, discrete
                );
            }
            Err(e) => {
                warn!("Q2 update failed for {} FY{}: {}", entry.concept.concept, fiscal_year, e);
                summary.errors.push(format!(
                    "Entity {} concept {} FY{} Q2: update failed: {}",
                    entity, entry.concept.concept, fiscal_year, e
                ));
            }
        }
    }

    fn fix_q3(
        &self,
        entity: &EntityId,
        fiscal_year: i32,
        entry: &QuarterSnapshot,
        summary: &mut NormalizationSummary,
    ) {
        let Some(q3) = &entry.q3 else {
            return;
        };
        if self.is_marked(q3) {
            summary.already_normalized += 1;
            return;
        }

        let Some(q2_cumulative) = self.cumulative_q2(entry) else {
            summary.q3_skipped += 1;
            debug!(
                "Skipped Q3 for {} FY{} of {}: no cumulative Q2 value",
                entry.concept.concept, fiscal_year, entity
            );
            return;
        };

        let discrete = q3.value - q2_cumulative;
        match self
            .store
            .update_value(q3.id, discrete, ValueTransform::DiscreteFromCumulative)
        {
            Ok(()) => {
                summary.q3_fixed += 1;
                debug!(
                    "Fixed Q3 for {} FY{}: {:.2} -> {:.2} (Q3 - Q2)",
                    entry.concept.concept, fiscal_year, q3.value, discrete
                );
            }
            Err(e) => {
                warn!("Q3 update failed for {} FY{}: {}", entry.concept.concept, fiscal_year, e);
                summary.errors.push(format!(
                    "Entity {} concept {} FY{} Q3: update failed: {}",
                    entity, entry.concept.concept, fiscal_year, e
                ));
            }
        }
    }

    /// The six-month figure as filed. A Q2 record already rewritten by an
    /// earlier, interrupted run is turned back into its cumulative form.
    fn cumulative_q2(&self, entry: &QuarterSnapshot) -> Option<f64> {
        let q2 = entry.q2.as_ref()?;
        if self.is_marked(q2) {
            entry.q1.as_ref().map(|q1| q2.value + q1.value)
        } else {
            Some(q2.value)
        }
    }
}
