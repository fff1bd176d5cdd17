//! Read/write seam between the derivation engine and wherever concept
//! definitions and data values actually live.

use crate::error::Result;
use crate::schema::{
    Cadence, ConceptDefinition, ConceptId, DataValue, EntityId, FiscalPeriod, StatementCategory,
    ValueId, ValueTransform,
};

pub mod memory;

pub use self::memory::MemoryStore;

/// Narrows a concept-definition lookup. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConceptFilter {
    pub concept: Option<String>,
    pub dimensional: Option<bool>,
}

impl ConceptFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn concept(mut self, name: impl Into<String>) -> Self {
        self.concept = Some(name.into());
        self
    }

    pub fn dimensional(mut self, dimensional: bool) -> Self {
        self.dimensional = Some(dimensional);
        self
    }

    pub fn matches(&self, definition: &ConceptDefinition) -> bool {
        if let Some(name) = &self.concept {
            if &definition.concept != name {
                return false;
            }
        }
        if let Some(dimensional) = self.dimensional {
            if definition.is_dimensional() != dimensional {
                return false;
            }
        }
        true
    }
}

/// Storage backends must give per-record atomicity for `update_value` and
/// `insert_value`; nothing here assumes multi-record transactions.
pub trait FilingStore: Send + Sync {
    /// Definitions for one entity/category/cadence, ordered by ascending id.
    fn find_concept_definitions(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
        cadence: Cadence,
        filter: &ConceptFilter,
    ) -> Result<Vec<ConceptDefinition>>;

    fn get_concept_parent(&self, definition: &ConceptDefinition)
        -> Result<Option<ConceptDefinition>>;

    /// At most one value per (concept, fiscal year, period). Sourced and
    /// derived values are both returned.
    fn find_value(
        &self,
        entity: &EntityId,
        concept_id: ConceptId,
        fiscal_year: i32,
        period: FiscalPeriod,
    ) -> Result<Option<DataValue>>;

    fn update_value(&self, id: ValueId, amount: f64, transform: ValueTransform) -> Result<()>;

    /// Inserts a new record and returns its assigned id. A second derived Q4
    /// record for the same concept and fiscal year is rejected with
    /// [`crate::ReconcileError::DuplicateDerivedValue`].
    fn insert_value(&self, value: DataValue) -> Result<ValueId>;

    fn list_fiscal_years(&self, entity: &EntityId, statement: StatementCategory)
        -> Result<Vec<i32>>;

    fn list_entities_with_category(&self, statement: StatementCategory) -> Result<Vec<EntityId>>;

    /// Removes derived values so a recalculation can reinsert them. Only batch
    /// callers use this; the derivation components never delete.
    fn delete_derived_values(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
    ) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ConceptKind;

    fn definition(concept: &str, kind: ConceptKind) -> ConceptDefinition {
        ConceptDefinition {
            id: ConceptId(1),
            entity: EntityId::new("0000789019"),
            statement: StatementCategory::IncomeStatement,
            cadence: Cadence::Quarterly,
            concept: concept.to_string(),
            label: String::new(),
            path: "001".to_string(),
            kind,
        }
    }

    #[test]
    fn test_filter_matching() {
        let plain = definition("us-gaap:Revenues", ConceptKind::Plain);
        let dimensional = definition(
            "us-gaap:Revenues",
            ConceptKind::Dimensional {
                parent: ConceptId(9),
            },
        );

        assert!(ConceptFilter::all().matches(&plain));
        assert!(ConceptFilter::all().concept("us-gaap:Revenues").matches(&plain));
        assert!(!ConceptFilter::all().concept("us-gaap:CostOfRevenue").matches(&plain));
        assert!(!ConceptFilter::all().dimensional(true).matches(&plain));
        assert!(ConceptFilter::all().dimensional(true).matches(&dimensional));
    }
}
