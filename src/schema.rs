use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable regulatory identifier of a filer (e.g. a zero-padded CIK).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct ConceptId(pub u64);

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "concept#{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct ValueId(pub u64);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value#{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StatementCategory {
    #[schemars(description = "Income statement line items (revenue, expenses, earnings)")]
    IncomeStatement,

    #[schemars(description = "Cash-flow statement line items (operating, investing, financing)")]
    CashFlows,

    #[schemars(description = "Balance sheet line items (assets, liabilities, equity)")]
    BalanceSheet,
}

impl StatementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomeStatement => "income_statement",
            Self::CashFlows => "cash_flows",
            Self::BalanceSheet => "balance_sheet",
        }
    }
}

impl fmt::Display for StatementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatementCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "income_statement" | "income" => Ok(Self::IncomeStatement),
            "cash_flows" | "cash_flow" | "cashflow" => Ok(Self::CashFlows),
            "balance_sheet" | "balance" => Ok(Self::BalanceSheet),
            other => Err(format!("unknown statement category '{}'", other)),
        }
    }
}

/// Which filing population a record belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum Cadence {
    #[schemars(description = "Quarterly filing (10-Q)")]
    Quarterly,

    #[schemars(description = "Annual filing (10-K)")]
    Annual,
}

impl Cadence {
    pub fn other(&self) -> Self {
        match self {
            Self::Quarterly => Self::Annual,
            Self::Annual => Self::Quarterly,
        }
    }

    pub fn form_type(&self) -> &'static str {
        match self {
            Self::Quarterly => "10-Q",
            Self::Annual => "10-K",
        }
    }

    pub fn period_type(&self) -> &'static str {
        match self {
            Self::Quarterly => "quarterly",
            Self::Annual => "annual",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.period_type())
    }
}

/// Plain line items have no parent; dimensional breakdowns always do, and the
/// parent lives in the same cadence population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConceptKind {
    Plain,
    Dimensional { parent: ConceptId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConceptDefinition {
    pub id: ConceptId,
    pub entity: EntityId,
    pub statement: StatementCategory,
    pub cadence: Cadence,

    #[schemars(description = "Taxonomy identifier, e.g. 'us-gaap:Revenues' or 'meta:FamilyOfAppsMember'")]
    pub concept: String,

    #[serde(default)]
    pub label: String,

    #[schemars(description = "Materialized hierarchical position, e.g. '001.002.001'")]
    #[serde(default)]
    pub path: String,

    #[serde(flatten)]
    pub kind: ConceptKind,
}

impl ConceptDefinition {
    pub fn is_dimensional(&self) -> bool {
        matches!(self.kind, ConceptKind::Dimensional { .. })
    }

    pub fn parent(&self) -> Option<ConceptId> {
        match self.kind {
            ConceptKind::Plain => None,
            ConceptKind::Dimensional { parent } => Some(parent),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum FiscalPeriod {
    Q1,
    Q2,
    Q3,
    Q4,
    FY,
}

impl FiscalPeriod {
    pub const QUARTERS: [FiscalPeriod; 4] = [Self::Q1, Self::Q2, Self::Q3, Self::Q4];

    /// Quarter number 1-4, `None` for the full fiscal year.
    pub fn quarter_number(&self) -> Option<u8> {
        match self {
            Self::Q1 => Some(1),
            Self::Q2 => Some(2),
            Self::Q3 => Some(3),
            Self::Q4 => Some(4),
            Self::FY => None,
        }
    }
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Q1 => "Q1",
            Self::Q2 => "Q2",
            Self::Q3 => "Q3",
            Self::Q4 => "Q4",
            Self::FY => "Annual",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportingPeriod {
    pub fiscal_year: i32,
    pub period: FiscalPeriod,

    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    pub end_date: NaiveDate,

    #[schemars(description = "Fiscal year end as filed, e.g. '--12-31'")]
    #[serde(default)]
    pub fiscal_year_end_code: Option<String>,
    #[serde(default)]
    pub accession_number: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,

    pub form_type: String,
    pub period_type: String,
    pub data_source: String,

    #[schemars(description = "Free-text provenance note, set on derived values")]
    #[serde(default)]
    pub note: Option<String>,
}

/// Marks whether a stored amount still holds the figure as filed or has
/// already been rewritten from a year-to-date cumulative into a discrete
/// quarterly amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValueTransform {
    #[default]
    AsFiled,
    DiscreteFromCumulative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DataValue {
    pub id: ValueId,
    pub concept_id: ConceptId,
    pub entity: EntityId,
    pub statement: StatementCategory,
    pub cadence: Cadence,
    pub period: ReportingPeriod,
    pub value: f64,

    #[serde(default)]
    pub derived: bool,

    #[schemars(description = "External fact identifier preserved for traceability")]
    #[serde(default)]
    pub fact_id: Option<String>,
    #[serde(default)]
    pub decimals: Option<String>,
    #[serde(default)]
    pub transform: ValueTransform,

    pub created_at: DateTime<Utc>,
}

impl DataValue {
    pub fn fiscal_year(&self) -> i32 {
        self.period.fiscal_year
    }

    pub fn fiscal_period(&self) -> FiscalPeriod {
        self.period.period
    }
}

/// Serializable image of a whole store, used to move datasets in and out of
/// [`crate::store::MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub concepts: Vec<ConceptDefinition>,
    #[serde(default)]
    pub values: Vec<DataValue>,
}

impl StoreSnapshot {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(StoreSnapshot)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
