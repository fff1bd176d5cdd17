use crate::error::{ReconcileError, Result};
use crate::schema::{
    Cadence, ConceptDefinition, ConceptId, DataValue, EntityId, FiscalPeriod, StatementCategory,
    StoreSnapshot, ValueId, ValueTransform,
};
use crate::store::{ConceptFilter, FilingStore};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::RwLock;

struct Tables {
    concepts: BTreeMap<ConceptId, ConceptDefinition>,
    values: BTreeMap<ValueId, DataValue>,
    next_value_id: u64,
}

/// Thread-safe in-memory store. Every operation takes the lock once, which
/// gives the per-record atomicity the engine relies on.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_snapshot(StoreSnapshot::default())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let next_value_id = snapshot
            .values
            .iter()
            .map(|v| v.id.0)
            .max()
            .map_or(1, |max| max + 1);

        let tables = Tables {
            concepts: snapshot.concepts.into_iter().map(|c| (c.id, c)).collect(),
            values: snapshot.values.into_iter().map(|v| (v.id, v)).collect(),
            next_value_id,
        };

        Self {
            tables: RwLock::new(tables),
        }
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        Ok(StoreSnapshot {
            concepts: tables.concepts.values().cloned().collect(),
            values: tables.values.values().cloned().collect(),
        })
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: StoreSnapshot = serde_json::from_reader(reader)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot()?;
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &snapshot)?;
        Ok(())
    }

    pub fn add_concept(&self, definition: ConceptDefinition) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| ReconcileError::LockPoisoned)?;
        tables.concepts.insert(definition.id, definition);
        Ok(())
    }

    /// Adds a value as-is, keeping its id. Used when seeding sourced data.
    pub fn add_value(&self, value: DataValue) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| ReconcileError::LockPoisoned)?;
        tables.next_value_id = tables.next_value_id.max(value.id.0 + 1);
        tables.values.insert(value.id, value);
        Ok(())
    }

    pub fn value(&self, id: ValueId) -> Result<Option<DataValue>> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        Ok(tables.values.get(&id).cloned())
    }

    pub fn value_count(&self) -> Result<usize> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        Ok(tables.values.len())
    }
}

impl FilingStore for MemoryStore {
    fn find_concept_definitions(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
        cadence: Cadence,
        filter: &ConceptFilter,
    ) -> Result<Vec<ConceptDefinition>> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        Ok(tables
            .concepts
            .values()
            .filter(|c| &c.entity == entity && c.statement == statement && c.cadence == cadence)
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    fn get_concept_parent(
        &self,
        definition: &ConceptDefinition,
    ) -> Result<Option<ConceptDefinition>> {
        let Some(parent_id) = definition.parent() else {
            return Ok(None);
        };

        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        let parent = tables
            .concepts
            .get(&parent_id)
            .ok_or(ReconcileError::ConceptNotFound(parent_id))?;
        Ok(Some(parent)
            .filter(|p| p.cadence == definition.cadence)
            .cloned())
    }

    fn find_value(
        &self,
        entity: &EntityId,
        concept_id: ConceptId,
        fiscal_year: i32,
        period: FiscalPeriod,
    ) -> Result<Option<DataValue>> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        Ok(tables
            .values
            .values()
            .find(|v| {
                &v.entity == entity
                    && v.concept_id == concept_id
                    && v.period.fiscal_year == fiscal_year
                    && v.period.period == period
            })
            .cloned())
    }

    fn update_value(&self, id: ValueId, amount: f64, transform: ValueTransform) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| ReconcileError::LockPoisoned)?;
        let value = tables
            .values
            .get_mut(&id)
            .ok_or(ReconcileError::ValueNotFound(id))?;
        value.value = amount;
        value.transform = transform;
        Ok(())
    }

    fn insert_value(&self, mut value: DataValue) -> Result<ValueId> {
        let mut tables = self.tables.write().map_err(|_| ReconcileError::LockPoisoned)?;

        if value.derived && value.period.period == FiscalPeriod::Q4 {
            let duplicate = tables.values.values().any(|v| {
                v.derived
                    && v.concept_id == value.concept_id
                    && v.period.fiscal_year == value.period.fiscal_year
                    && v.period.period == FiscalPeriod::Q4
            });
            if duplicate {
                return Err(ReconcileError::DuplicateDerivedValue {
                    concept_id: value.concept_id,
                    fiscal_year: value.period.fiscal_year,
                });
            }
        }

        let id = ValueId(tables.next_value_id);
        tables.next_value_id += 1;
        value.id = id;
        tables.values.insert(id, value);
        Ok(id)
    }

    fn list_fiscal_years(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
    ) -> Result<Vec<i32>> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        let years: BTreeSet<i32> = tables
            .values
            .values()
            .filter(|v| &v.entity == entity && v.statement == statement)
            .map(|v| v.period.fiscal_year)
            .collect();
        Ok(years.into_iter().collect())
    }

    fn list_entities_with_category(&self, statement: StatementCategory) -> Result<Vec<EntityId>> {
        let tables = self.tables.read().map_err(|_| ReconcileError::LockPoisoned)?;
        let entities: BTreeSet<EntityId> = tables
            .values
            .values()
            .filter(|v| v.statement == statement)
            .map(|v| v.entity.clone())
            .collect();
        Ok(entities.into_iter().collect())
    }

    fn delete_derived_values(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
    ) -> Result<usize> {
        let mut tables = self.tables.write().map_err(|_| ReconcileError::LockPoisoned)?;
        let before = tables.values.len();
        tables
            .values
            .retain(|_, v| !(v.derived && &v.entity == entity && v.statement == statement));
        let deleted = before - tables.values.len();
        debug!(
            "Deleted {} derived values for {} ({})",
            deleted, entity, statement
        );
        Ok(deleted)
    }
}
