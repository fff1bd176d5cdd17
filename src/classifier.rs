use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConceptClass {
    #[schemars(
        description = "Activity accumulated over a period (e.g. revenue). Q4 = Annual - (Q1 + Q2 + Q3)."
    )]
    Flow,

    #[schemars(
        description = "Snapshot at a date (e.g. cash balance, shares outstanding). Q4 = Annual."
    )]
    PointInTime,
}

/// Case-insensitive substrings that mark a concept as a snapshot quantity.
///
/// The table is data: callers can load their own from configuration and the
/// classifier never hardcodes a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatternTable {
    #[schemars(
        description = "Substrings (case-insensitive) of a concept name or label that denote point-in-time semantics"
    )]
    pub point_in_time: Vec<String>,
}

impl PatternTable {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            point_in_time: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            point_in_time: Vec::new(),
        }
    }
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::new([
            "SharesOutstanding",
            "CashAndCashEquivalentsAtCarryingValue",
            "CashCashEquivalentsRestrictedCashAndRestrictedCashEquivalents",
            "EndOfYear",
            "EndOfPeriod",
            "BeginningOfYear",
            "BeginningOfPeriod",
            "BeginningBalance",
            "EndingBalance",
            "EffectOfExchangeRate",
            "PeriodIncreaseDecrease",
            // label spellings
            "shares outstanding",
            "end of period",
            "end of year",
            "beginning of period",
            "beginning of year",
            "ending balance",
            "beginning balance",
            "effect of exchange rate",
        ])
    }
}

#[derive(Debug, Clone)]
pub struct ConceptClassifier {
    // (original, lowercased)
    patterns: Vec<(String, String)>,
}

impl ConceptClassifier {
    pub fn new(table: &PatternTable) -> Self {
        let patterns = table
            .point_in_time
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| (p.clone(), p.to_lowercase()))
            .collect();
        Self { patterns }
    }

    /// Unmatched names default to [`ConceptClass::Flow`].
    pub fn classify(&self, concept: &str, label: &str) -> ConceptClass {
        match self.explain(concept, label) {
            Some(_) => ConceptClass::PointInTime,
            None => ConceptClass::Flow,
        }
    }

    /// The pattern that made the concept point-in-time, if any.
    pub fn explain(&self, concept: &str, label: &str) -> Option<&str> {
        let concept = concept.to_lowercase();
        let label = label.to_lowercase();
        self.patterns
            .iter()
            .find(|(_, lower)| concept.contains(lower.as_str()) || label.contains(lower.as_str()))
            .map(|(original, _)| original.as_str())
    }
}

impl Default for ConceptClassifier {
    fn default() -> Self {
        Self::new(&PatternTable::default())
    }
}
