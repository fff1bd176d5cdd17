use crate::error::{ReconcileError, Result};
use crate::resolver::ResolverTier;
use crate::schema::{Cadence, ConceptDefinition, DataValue, FiscalPeriod, ValueId, ValueTransform};
use crate::store::FilingStore;
use crate::utils::{months_between, next_day, spans_full_year};
use chrono::{NaiveDate, Utc};
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DERIVED_DATA_SOURCE: &str = "calculated_from_annual_filing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DerivationMethod {
    /// Q4 = Annual - (Q1 + Q2 + Q3)
    AnnualMinusQuarters,
    /// Q4 = Annual
    PointInTimeCopy,
}

impl DerivationMethod {
    fn describe(&self) -> &'static str {
        match self {
            Self::AnnualMinusQuarters => "Q4 calculated from annual 10-K minus Q1-Q3",
            Self::PointInTimeCopy => "Q4 copied from annual 10-K point-in-time value",
        }
    }
}

/// Everything needed to build one derived Q4 record.
#[derive(Debug, Clone)]
pub struct DerivedValueRequest<'r> {
    /// Quarterly-cadence concept the record belongs to.
    pub target: &'r ConceptDefinition,
    pub fiscal_year: i32,
    pub amount: f64,
    pub annual: &'r DataValue,
    pub q3_end: Option<NaiveDate>,
    pub method: DerivationMethod,
    pub tier: ResolverTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Inserted(ValueId),
    AlreadyPresent,
}

pub struct DerivedValueMaterializer<'a, S: FilingStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: FilingStore + ?Sized> DerivedValueMaterializer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Metadata comes from the annual record; only the fields that say which
    /// filing cadence produced it are rewritten for a quarterly record.
    pub fn build_record(&self, request: &DerivedValueRequest<'_>) -> DataValue {
        let annual = request.annual;
        let mut period = annual.period.clone();

        if let Some(start) = annual.period.start_date {
            if !spans_full_year(start, annual.period.end_date) {
                warn!(
                    "Annual value {} for {} FY{} covers {} months, not a full year",
                    annual.id,
                    request.target.concept,
                    request.fiscal_year,
                    months_between(start, annual.period.end_date)
                );
            }
        }

        period.fiscal_year = request.fiscal_year;
        period.period = FiscalPeriod::Q4;
        period.form_type = Cadence::Quarterly.form_type().to_string();
        period.period_type = Cadence::Quarterly.period_type().to_string();
        period.data_source = DERIVED_DATA_SOURCE.to_string();
        if request.method == DerivationMethod::AnnualMinusQuarters {
            period.start_date = request.q3_end.and_then(next_day);
        }
        period.note = Some(format!(
            "{} (resolver tier: {})",
            request.method.describe(),
            request.tier
        ));

        DataValue {
            id: ValueId(0),
            concept_id: request.target.id,
            entity: request.target.entity.clone(),
            statement: request.target.statement,
            cadence: Cadence::Quarterly,
            period,
            value: request.amount,
            derived: true,
            fact_id: annual
                .fact_id
                .as_ref()
                .map(|fact| format!("derived-from:{}", fact)),
            decimals: annual.decimals.clone(),
            transform: ValueTransform::AsFiled,
            created_at: Utc::now(),
        }
    }

    /// Idempotent: a Q4 record already present for the concept/year, whether
    /// seen up front or reported by the store's uniqueness guard, yields
    /// [`MaterializeOutcome::AlreadyPresent`] and nothing is written.
    pub fn materialize(&self, request: &DerivedValueRequest<'_>) -> Result<MaterializeOutcome> {
        let target = request.target;

        if self
            .store
            .find_value(&target.entity, target.id, request.fiscal_year, FiscalPeriod::Q4)?
            .is_some()
        {
            warn!(
                "Q4 for {} ({}) FY{} of {} appeared before insert; leaving it in place",
                target.concept, target.id, request.fiscal_year, target.entity
            );
            return Ok(MaterializeOutcome::AlreadyPresent);
        }

        let record = self.build_record(request);
        match self.store.insert_value(record) {
            Ok(id) => {
                debug!(
                    "Inserted derived Q4 {} for {} FY{}: {:.2}",
                    id, target.concept, request.fiscal_year, request.amount
                );
                Ok(MaterializeOutcome::Inserted(id))
            }
            Err(ReconcileError::DuplicateDerivedValue { .. }) => {
                warn!(
                    "Duplicate derived Q4 rejected for {} ({}) FY{} of {}",
                    target.concept, target.id, request.fiscal_year, target.entity
                );
                Ok(MaterializeOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }
}
