use crate::classifier::{ConceptClass, ConceptClassifier};
use crate::error::Result;
use crate::materializer::{
    DerivationMethod, DerivedValueMaterializer, DerivedValueRequest, MaterializeOutcome,
};
use crate::resolver::{ConceptResolver, ResolverTier};
use crate::schema::{Cadence, ConceptDefinition, ConceptId, EntityId, FiscalPeriod, StatementCategory};
use crate::store::FilingStore;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a concept-instance produced no Q4 record. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NotQuarterlyConcept,
    AlreadyExists,
    NoMatchingAnnualConcept,
    MissingInputs { inputs: Vec<FiscalPeriod> },
    PointInTimeWithoutAnnual,
    DuplicateAtInsert,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotQuarterlyConcept => f.write_str("concept is not from the quarterly population"),
            Self::AlreadyExists => f.write_str("Q4 value already exists"),
            Self::NoMatchingAnnualConcept => f.write_str("no matching annual concept"),
            Self::MissingInputs { inputs } => {
                let names: Vec<String> = inputs.iter().map(|p| p.to_string()).collect();
                write!(f, "missing values: {}", names.join(", "))
            }
            Self::PointInTimeWithoutAnnual => {
                f.write_str("point-in-time concept, no annual value to copy")
            }
            Self::DuplicateAtInsert => {
                f.write_str("Q4 value appeared before insert; duplicate rejected")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Derived,
    Skipped,
    Error,
}

/// Result of one (entity, concept, fiscal year) derivation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationRecord {
    pub entity: EntityId,
    pub statement: StatementCategory,
    pub concept: String,
    pub concept_id: ConceptId,
    pub path: String,
    pub fiscal_year: i32,
    pub status: RecordStatus,
    pub matched: bool,
    pub derived: bool,
    pub reason: Option<String>,
    pub skip: Option<SkipReason>,
    pub resolver_tier_used: Option<ResolverTier>,
    pub class: Option<ConceptClass>,
    pub value: Option<f64>,
}

impl DerivationRecord {
    fn new(concept: &ConceptDefinition, fiscal_year: i32) -> Self {
        Self {
            entity: concept.entity.clone(),
            statement: concept.statement,
            concept: concept.concept.clone(),
            concept_id: concept.id,
            path: concept.path.clone(),
            fiscal_year,
            status: RecordStatus::Skipped,
            matched: false,
            derived: false,
            reason: None,
            skip: None,
            resolver_tier_used: None,
            class: None,
            value: None,
        }
    }

    fn skip(&mut self, reason: SkipReason) {
        debug!(
            "Skipped Q4 for {} ({}) FY{} of {}: {}",
            self.concept, self.path, self.fiscal_year, self.entity, reason
        );
        self.status = RecordStatus::Skipped;
        self.reason = Some(reason.to_string());
        self.skip = Some(reason);
    }

    pub fn is_error(&self) -> bool {
        self.status == RecordStatus::Error
    }
}

/// Produces the missing fourth-quarter value of one quarterly concept for one
/// fiscal year.
pub struct Period4Deriver<'a, S: FilingStore + ?Sized> {
    store: &'a S,
    classifier: &'a ConceptClassifier,
    resolver: ConceptResolver<'a, S>,
    materializer: DerivedValueMaterializer<'a, S>,
}

impl<'a, S: FilingStore + ?Sized> Period4Deriver<'a, S> {
    pub fn new(store: &'a S, classifier: &'a ConceptClassifier) -> Self {
        Self {
            store,
            classifier,
            resolver: ConceptResolver::new(store),
            materializer: DerivedValueMaterializer::new(store),
        }
    }

    /// Never fails: storage errors become a record with status `Error` that
    /// keeps whatever was learned before the failure.
    pub fn derive(&self, concept: &ConceptDefinition, fiscal_year: i32) -> DerivationRecord {
        let mut record = DerivationRecord::new(concept, fiscal_year);
        if let Err(e) = self.try_derive(concept, fiscal_year, &mut record) {
            warn!(
                "Q4 derivation failed for {} ({}) FY{} of {}: {}",
                concept.concept, concept.path, fiscal_year, concept.entity, e
            );
            record.status = RecordStatus::Error;
            record.reason = Some(format!("storage error: {}", e));
        }
        record
    }

    fn try_derive(
        &self,
        concept: &ConceptDefinition,
        fiscal_year: i32,
        record: &mut DerivationRecord,
    ) -> Result<()> {
        let entity = &concept.entity;

        if concept.cadence != Cadence::Quarterly {
            record.skip(SkipReason::NotQuarterlyConcept);
            return Ok(());
        }

        // 1. Already present
        if self
            .store
            .find_value(entity, concept.id, fiscal_year, FiscalPeriod::Q4)?
            .is_some()
        {
            record.skip(SkipReason::AlreadyExists);
            return Ok(());
        }

        // 2. Counterpart in the annual population
        let Some(resolution) = self.resolver.resolve(concept)? else {
            record.skip(SkipReason::NoMatchingAnnualConcept);
            return Ok(());
        };
        record.matched = true;
        record.resolver_tier_used = Some(resolution.tier);

        // 3. Inputs
        let q1 = self.store.find_value(entity, concept.id, fiscal_year, FiscalPeriod::Q1)?;
        let q2 = self.store.find_value(entity, concept.id, fiscal_year, FiscalPeriod::Q2)?;
        let q3 = self.store.find_value(entity, concept.id, fiscal_year, FiscalPeriod::Q3)?;
        let annual = self.store.find_value(
            entity,
            resolution.target.id,
            fiscal_year,
            FiscalPeriod::FY,
        )?;

        // 4. Arithmetic class
        let class = match self.classifier.explain(&concept.concept, &concept.label) {
            Some(pattern) => {
                debug!("{} is point-in-time (pattern '{}')", concept.concept, pattern);
                ConceptClass::PointInTime
            }
            None => ConceptClass::Flow,
        };
        record.class = Some(class);

        let (q1, q2, q3, annual) = match (q1, q2, q3, annual) {
            (Some(q1), Some(q2), Some(q3), Some(annual)) => (q1, q2, q3, annual),
            (Some(_), Some(_), Some(_), None) if class == ConceptClass::PointInTime => {
                record.skip(SkipReason::PointInTimeWithoutAnnual);
                return Ok(());
            }
            (q1, q2, q3, annual) => {
                let mut inputs: Vec<FiscalPeriod> = [
                    (FiscalPeriod::Q1, q1.is_some()),
                    (FiscalPeriod::Q2, q2.is_some()),
                    (FiscalPeriod::Q3, q3.is_some()),
                ]
                .into_iter()
                .filter(|(_, present)| !present)
                .map(|(period, _)| period)
                .collect();
                if annual.is_none() {
                    inputs.push(FiscalPeriod::FY);
                }
                record.skip(SkipReason::MissingInputs { inputs });
                return Ok(());
            }
        };

        let (amount, method) = match class {
            ConceptClass::PointInTime => (annual.value, DerivationMethod::PointInTimeCopy),
            ConceptClass::Flow => (
                annual.value - (q1.value + q2.value + q3.value),
                DerivationMethod::AnnualMinusQuarters,
            ),
        };

        // 5. Persist
        let request = DerivedValueRequest {
            target: concept,
            fiscal_year,
            amount,
            annual: &annual,
            q3_end: Some(q3.period.end_date),
            method,
            tier: resolution.tier,
        };
        match self.materializer.materialize(&request)? {
            MaterializeOutcome::Inserted(_) => {
                debug!(
                    "Calculated Q4 for {} ({}) FY{} of {}: {:.2} via {}",
                    concept.concept, concept.path, fiscal_year, entity, amount, resolution.tier
                );
                record.status = RecordStatus::Derived;
                record.derived = true;
                record.value = Some(amount);
            }
            MaterializeOutcome::AlreadyPresent => record.skip(SkipReason::DuplicateAtInsert),
        }
        Ok(())
    }
}
