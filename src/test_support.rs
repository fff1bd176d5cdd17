use crate::schema::{
    Cadence, ConceptDefinition, ConceptId, ConceptKind, DataValue, EntityId, FiscalPeriod,
    ReportingPeriod, StatementCategory, ValueId, ValueTransform,
};
use crate::store::{FilingStore, MemoryStore};
use chrono::{NaiveDate, Utc};

pub struct Fixture {
    pub store: MemoryStore,
    pub entity: EntityId,
    next_concept: u64,
}

impl Fixture {
    pub fn new(entity: &str) -> Self {
        Self {
            store: MemoryStore::new(),
            entity: EntityId::new(entity),
            next_concept: 1,
        }
    }

    pub fn concept(
        &mut self,
        statement: StatementCategory,
        cadence: Cadence,
        concept: &str,
        label: &str,
        path: &str,
        parent: Option<&ConceptDefinition>,
    ) -> ConceptDefinition {
        let definition = ConceptDefinition {
            id: ConceptId(self.next_concept),
            entity: self.entity.clone(),
            statement,
            cadence,
            concept: concept.to_string(),
            label: label.to_string(),
            path: path.to_string(),
            kind: match parent {
                Some(p) => ConceptKind::Dimensional { parent: p.id },
                None => ConceptKind::Plain,
            },
        };
        self.next_concept += 1;
        self.store.add_concept(definition.clone()).unwrap();
        definition
    }

    /// Quarterly and annual plain definitions of the same concept.
    pub fn concept_pair(
        &mut self,
        statement: StatementCategory,
        concept: &str,
        label: &str,
    ) -> (ConceptDefinition, ConceptDefinition) {
        let q = self.concept(statement, Cadence::Quarterly, concept, label, "001", None);
        let a = self.concept(statement, Cadence::Annual, concept, label, "001", None);
        (q, a)
    }

    pub fn value(
        &self,
        definition: &ConceptDefinition,
        fiscal_year: i32,
        period: FiscalPeriod,
        amount: f64,
    ) -> ValueId {
        let value = DataValue {
            id: ValueId(0),
            concept_id: definition.id,
            entity: self.entity.clone(),
            statement: definition.statement,
            cadence: definition.cadence,
            period: reporting_period(fiscal_year, period, definition.cadence),
            value: amount,
            derived: false,
            fact_id: Some(format!("fact-{}-{}-{}", definition.id.0, fiscal_year, period)),
            decimals: Some("-6".to_string()),
            transform: ValueTransform::AsFiled,
            created_at: Utc::now(),
        };
        self.store.insert_value(value).unwrap()
    }

    pub fn amount(&self, definition: &ConceptDefinition, fiscal_year: i32, period: FiscalPeriod) -> Option<f64> {
        self.store
            .find_value(&self.entity, definition.id, fiscal_year, period)
            .unwrap()
            .map(|v| v.value)
    }
}

pub fn reporting_period(fiscal_year: i32, period: FiscalPeriod, cadence: Cadence) -> ReportingPeriod {
    let (start, end) = match period {
        FiscalPeriod::Q1 => ((1, 1), (3, 31)),
        FiscalPeriod::Q2 => ((4, 1), (6, 30)),
        FiscalPeriod::Q3 => ((7, 1), (9, 30)),
        FiscalPeriod::Q4 => ((10, 1), (12, 31)),
        FiscalPeriod::FY => ((1, 1), (12, 31)),
    };

    ReportingPeriod {
        fiscal_year,
        period,
        start_date: NaiveDate::from_ymd_opt(fiscal_year, start.0, start.1),
        end_date: NaiveDate::from_ymd_opt(fiscal_year, end.0, end.1).unwrap(),
        fiscal_year_end_code: Some("--12-31".to_string()),
        accession_number: Some(format!("0000000000-{}-{}", fiscal_year % 100, period)),
        context_id: Some(format!("c-{}-{}", fiscal_year, period)),
        unit: Some("USD".to_string()),
        company_name: Some("Test Corp".to_string()),
        form_type: cadence.form_type().to_string(),
        period_type: cadence.period_type().to_string(),
        data_source: "sec_api_raw".to_string(),
        note: None,
    }
}
