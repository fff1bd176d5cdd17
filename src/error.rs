use crate::schema::{ConceptId, EntityId, ValueId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Concept definition {0} not found")]
    ConceptNotFound(ConceptId),

    #[error("Data value {0} not found")]
    ValueNotFound(ValueId),

    #[error("Derived Q4 value already present for concept {concept_id} FY{fiscal_year}")]
    DuplicateDerivedValue {
        concept_id: ConceptId,
        fiscal_year: i32,
    },

    #[error("Storage failure for entity {entity}: {details}")]
    Storage { entity: EntityId, details: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid worker count {0}: must be at least 1")]
    InvalidWorkerCount(usize),

    #[error("Invalid audit tolerance {0}: must be finite and non-negative")]
    InvalidTolerance(f64),

    #[error("Series audit failed for {concept} FY{fiscal_year}: {details}")]
    AuditViolation {
        concept: String,
        fiscal_year: i32,
        details: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
