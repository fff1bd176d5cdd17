use crate::classifier::{ConceptClass, ConceptClassifier};
use crate::error::{ReconcileError, Result};
use crate::resolver::ConceptResolver;
use crate::schema::{
    Cadence, ConceptDefinition, ConceptId, EntityId, FiscalPeriod, StatementCategory,
};
use crate::store::{ConceptFilter, FilingStore};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_AUDIT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    /// Q1 + Q2 + Q3 + Q4 does not reproduce the annual total.
    FlowSumMismatch {
        annual: f64,
        quarters_sum: f64,
        difference: f64,
    },
    /// Derived Q4 of a point-in-time concept differs from the annual value.
    PointInTimeMismatch {
        annual: f64,
        q4: f64,
        difference: f64,
    },
    /// Negative derived flow; legitimate for some concepts but worth a look.
    NegativeDerivedFlow { value: f64 },
    /// Derived Q4 ends on a different date than its annual source.
    PeriodEndMismatch,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowSumMismatch {
                annual,
                quarters_sum,
                difference,
            } => write!(
                f,
                "quarters sum to {:.2}, annual is {:.2} (difference {:.2})",
                quarters_sum, annual, difference
            ),
            Self::PointInTimeMismatch {
                annual,
                q4,
                difference,
            } => write!(
                f,
                "Q4 is {:.2}, annual is {:.2} (difference {:.2})",
                q4, annual, difference
            ),
            Self::NegativeDerivedFlow { value } => {
                write!(f, "derived Q4 flow is negative ({:.2})", value)
            }
            Self::PeriodEndMismatch => f.write_str("Q4 period end differs from annual period end"),
        }
    }
}

impl FindingKind {
    /// Warnings are reported but do not fail [`SeriesAuditor::verify_entity`].
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::NegativeDerivedFlow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub concept: String,
    pub concept_id: ConceptId,
    pub fiscal_year: i32,
    pub kind: FindingKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub entity: EntityId,
    pub statement: StatementCategory,
    pub series_checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.iter().all(|f| f.kind.is_warning())
    }

    pub fn violations(&self) -> impl Iterator<Item = &AuditFinding> {
        self.findings.iter().filter(|f| !f.kind.is_warning())
    }
}

/// Re-checks every derived Q4 against the annual filing it came from.
pub struct SeriesAuditor<'a, S: FilingStore + ?Sized> {
    store: &'a S,
    classifier: &'a ConceptClassifier,
    resolver: ConceptResolver<'a, S>,
    tolerance: f64,
}

impl<'a, S: FilingStore + ?Sized> SeriesAuditor<'a, S> {
    pub fn new(store: &'a S, classifier: &'a ConceptClassifier, tolerance: f64) -> Result<Self> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ReconcileError::InvalidTolerance(tolerance));
        }
        Ok(Self {
            store,
            classifier,
            resolver: ConceptResolver::new(store),
            tolerance,
        })
    }

    pub fn audit_entity(
        &self,
        entity: &EntityId,
        statement: StatementCategory,
    ) -> Result<AuditReport> {
        let concepts = self.store.find_concept_definitions(
            entity,
            statement,
            Cadence::Quarterly,
            &ConceptFilter::all(),
        )?;
        let fiscal_years = self.store.list_fiscal_years(entity, statement)?;

        let mut report = AuditReport {
            entity: entity.clone(),
            statement,
            series_checked: 0,
            findings: Vec::new(),
        };

        for concept in &concepts {
            for &fiscal_year in &fiscal_years {
                if let Some(kinds) = self.audit_series(concept, fiscal_year)? {
                    report.series_checked += 1;
                    report
                        .findings
                        .extend(kinds.into_iter().map(|kind| AuditFinding {
                            concept: concept.concept.clone(),
                            concept_id: concept.id,
                            fiscal_year,
                            kind,
                        }));
                }
            }
        }

        debug!(
            "Audited {} derived series for {} {}: {} findings",
            report.series_checked,
            entity,
            statement,
            report.findings.len()
        );
        Ok(report)
    }

    /// Fails on the first finding that is not a warning.
    pub fn verify_entity(&self, entity: &EntityId, statement: StatementCategory) -> Result<()> {
        let report = self.audit_entity(entity, statement)?;
        for finding in &report.findings {
            if finding.kind.is_warning() {
                warn!(
                    "{} FY{} of {}: {}",
                    finding.concept, finding.fiscal_year, entity, finding.kind
                );
            }
        }
        let first = report.violations().next().cloned();
        match first {
            Some(finding) => Err(ReconcileError::AuditViolation {
                concept: finding.concept,
                fiscal_year: finding.fiscal_year,
                details: finding.kind.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// `None` when the concept has no derived Q4 for the year or the inputs
    /// the derivation used are no longer all present.
    fn audit_series(
        &self,
        concept: &ConceptDefinition,
        fiscal_year: i32,
    ) -> Result<Option<Vec<FindingKind>>> {
        let entity = &concept.entity;
        let Some(q4) = self
            .store
            .find_value(entity, concept.id, fiscal_year, FiscalPeriod::Q4)?
            .filter(|v| v.derived)
        else {
            return Ok(None);
        };
        let Some(resolution) = self.resolver.resolve(concept)? else {
            return Ok(None);
        };
        let Some(annual) = self.store.find_value(
            entity,
            resolution.target.id,
            fiscal_year,
            FiscalPeriod::FY,
        )?
        else {
            return Ok(None);
        };

        let mut kinds = Vec::new();
        if q4.period.end_date != annual.period.end_date {
            kinds.push(FindingKind::PeriodEndMismatch);
        }

        match self.classifier.classify(&concept.concept, &concept.label) {
            ConceptClass::PointInTime => {
                let difference = (q4.value - annual.value).abs();
                if difference > self.tolerance {
                    kinds.push(FindingKind::PointInTimeMismatch {
                        annual: annual.value,
                        q4: q4.value,
                        difference,
                    });
                }
            }
            ConceptClass::Flow => {
                let mut quarters_sum = q4.value;
                for period in [FiscalPeriod::Q1, FiscalPeriod::Q2, FiscalPeriod::Q3] {
                    match self.store.find_value(entity, concept.id, fiscal_year, period)? {
                        Some(value) => quarters_sum += value.value,
                        None => return Ok(None),
                    }
                }
                let difference = (quarters_sum - annual.value).abs();
                if difference > self.tolerance {
                    kinds.push(FindingKind::FlowSumMismatch {
                        annual: annual.value,
                        quarters_sum,
                        difference,
                    });
                }
                if q4.value < 0.0 {
                    kinds.push(FindingKind::NegativeDerivedFlow { value: q4.value });
                }
            }
        }

        Ok(Some(kinds))
    }
}
