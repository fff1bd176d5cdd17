use crate::audit::DEFAULT_AUDIT_TOLERANCE;
use crate::classifier::PatternTable;
use crate::error::{ReconcileError, Result};
use crate::schema::StatementCategory;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_statements() -> Vec<StatementCategory> {
    vec![StatementCategory::IncomeStatement, StatementCategory::CashFlows]
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_audit_tolerance() -> f64 {
    DEFAULT_AUDIT_TOLERANCE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReconcilerConfig {
    #[schemars(description = "Point-in-time classification patterns; replaces the built-in table when given")]
    #[serde(default)]
    pub patterns: PatternTable,

    #[schemars(description = "Statement categories to derive Q4 values for, in processing order")]
    #[serde(default = "default_statements")]
    pub statements: Vec<StatementCategory>,

    #[schemars(description = "Rewrite cumulative Q2/Q3 cash-flow values before deriving Q4")]
    #[serde(default = "default_true")]
    pub normalize_cash_flows: bool,

    #[schemars(
        description = "Ignore the normalization marker and rewrite Q2/Q3 again. Corrupts already-normalized data; only for restoring legacy behaviour."
    )]
    #[serde(default)]
    pub force_renormalize: bool,

    #[schemars(description = "Entities processed in parallel")]
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[schemars(description = "Absolute difference tolerated when re-checking derived series")]
    #[serde(default = "default_audit_tolerance")]
    pub audit_tolerance: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            patterns: PatternTable::default(),
            statements: default_statements(),
            normalize_cash_flows: true,
            force_renormalize: false,
            workers: default_workers(),
            audit_tolerance: DEFAULT_AUDIT_TOLERANCE,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReconcileError::InvalidWorkerCount(self.workers));
        }
        if !self.audit_tolerance.is_finite() || self.audit_tolerance < 0.0 {
            return Err(ReconcileError::InvalidTolerance(self.audit_tolerance));
        }
        if self.statements.is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "at least one statement category is required".to_string(),
            ));
        }
        for (idx, statement) in self.statements.iter().enumerate() {
            if self.statements[..idx].contains(statement) {
                return Err(ReconcileError::InvalidConfig(format!(
                    "statement category '{}' listed twice",
                    statement
                )));
            }
        }
        if let Some(idx) = self
            .patterns
            .point_in_time
            .iter()
            .position(|p| p.trim().is_empty())
        {
            return Err(ReconcileError::InvalidConfig(format!(
                "point-in-time pattern #{} is blank",
                idx
            )));
        }
        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReconcilerConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ReconcilerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ReconcilerConfig::default());
        assert!(config.normalize_cash_flows);
        assert!(!config.force_renormalize);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let config = ReconcilerConfig::from_json_str(
            r#"{
                "patterns": { "point_in_time": ["Balance"] },
                "statements": ["cash_flows"],
                "workers": 2
            }"#,
        )
        .unwrap();
        assert_eq!(config.patterns.point_in_time, vec!["Balance".to_string()]);
        assert_eq!(config.statements, vec![StatementCategory::CashFlows]);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_validation_errors() {
        let zero_workers = ReconcilerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(ReconcileError::InvalidWorkerCount(0))
        ));

        let duplicate = ReconcilerConfig {
            statements: vec![StatementCategory::CashFlows, StatementCategory::CashFlows],
            ..Default::default()
        };
        assert!(matches!(duplicate.validate(), Err(ReconcileError::InvalidConfig(_))));

        let blank = ReconcilerConfig {
            patterns: PatternTable::new(["EndOfYear", "  "]),
            ..Default::default()
        };
        assert!(matches!(blank.validate(), Err(ReconcileError::InvalidConfig(_))));

        let tolerance = ReconcilerConfig {
            audit_tolerance: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            tolerance.validate(),
            Err(ReconcileError::InvalidTolerance(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "force_renormalize": true, "audit_tolerance": 0.5 }}"#).unwrap();

        let config = ReconcilerConfig::from_json_file(file.path()).unwrap();
        assert!(config.force_renormalize);
        assert_eq!(config.audit_tolerance, 0.5);
    }

    #[test]
    fn test_schema_generation() {
        let json = ReconcilerConfig::schema_as_json().unwrap();
        assert!(json.contains("normalize_cash_flows"));
        assert!(json.contains("point_in_time"));
    }
}
