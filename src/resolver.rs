use crate::error::Result;
use crate::schema::ConceptDefinition;
use crate::store::{ConceptFilter, FilingStore};
use crate::utils::shares_path_prefix;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which step of the matching strategy produced a cross-cadence match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolverTier {
    #[schemars(description = "Single candidate with the same concept name and dimensional flag")]
    ExactIdentity,

    #[schemars(description = "Dimensional breakdown matched through its parent line item's name")]
    ParentRelationship,

    #[schemars(description = "Fallback: identical materialized path")]
    ExactPath,

    #[schemars(description = "Fallback: identical label")]
    ExactLabel,

    #[schemars(description = "Fallback: first two path segments agree")]
    PathPrefix,

    #[schemars(description = "Fallback: ambiguous, lowest concept id chosen")]
    FirstCandidate,
}

impl ResolverTier {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::ExactIdentity | Self::ParentRelationship)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactIdentity => "exact_identity",
            Self::ParentRelationship => "parent_relationship",
            Self::ExactPath => "exact_path",
            Self::ExactLabel => "exact_label",
            Self::PathPrefix => "path_prefix",
            Self::FirstCandidate => "first_candidate",
        }
    }
}

impl fmt::Display for ResolverTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub target: ConceptDefinition,
    pub tier: ResolverTier,
    /// How many same-name candidates existed before any narrowing.
    pub candidates: usize,
}

const PATH_PREFIX_SEGMENTS: usize = 2;

/// Finds the counterpart of a concept definition in the other cadence's
/// population (quarterly <-> annual) for the same entity and statement.
pub struct ConceptResolver<'a, S: FilingStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: FilingStore + ?Sized> ConceptResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn resolve(&self, source: &ConceptDefinition) -> Result<Option<Resolution>> {
        let target_cadence = source.cadence.other();
        let filter = ConceptFilter::all()
            .concept(source.concept.clone())
            .dimensional(source.is_dimensional());

        let mut candidates = self.store.find_concept_definitions(
            &source.entity,
            source.statement,
            target_cadence,
            &filter,
        )?;
        candidates.sort_by_key(|c| c.id);
        let total = candidates.len();

        // 1. Exact identity
        match total {
            0 => {
                debug!(
                    "No {} counterpart for {} ({}) of entity {}",
                    target_cadence, source.concept, source.path, source.entity
                );
                return Ok(None);
            }
            1 => {
                return Ok(Some(Resolution {
                    target: candidates.remove(0),
                    tier: ResolverTier::ExactIdentity,
                    candidates: total,
                }));
            }
            _ => {}
        }

        // 2. Parent relationship
        if let Some(source_parent) = self.store.get_concept_parent(source)? {
            let mut same_parent = Vec::new();
            for candidate in &candidates {
                if let Some(candidate_parent) = self.store.get_concept_parent(candidate)? {
                    if candidate_parent.concept == source_parent.concept {
                        same_parent.push(candidate.clone());
                    }
                }
            }

            match same_parent.len() {
                0 => debug!(
                    "No {} candidate of {} shares parent {}",
                    target_cadence, source.concept, source_parent.concept
                ),
                1 => {
                    return Ok(Some(Resolution {
                        target: same_parent.remove(0),
                        tier: ResolverTier::ParentRelationship,
                        candidates: total,
                    }));
                }
                _ => candidates = same_parent,
            }
        }

        // 3. Path-based fallback
        Ok(Some(self.fallback(source, candidates, total)))
    }

    fn fallback(
        &self,
        source: &ConceptDefinition,
        mut candidates: Vec<ConceptDefinition>,
        total: usize,
    ) -> Resolution {
        type Narrowing = (ResolverTier, fn(&ConceptDefinition, &ConceptDefinition) -> bool);
        let steps: [Narrowing; 3] = [
            (ResolverTier::ExactPath, |s, c| {
                !s.path.is_empty() && s.path == c.path
            }),
            (ResolverTier::ExactLabel, |s, c| {
                !s.label.is_empty() && s.label == c.label
            }),
            (ResolverTier::PathPrefix, |s, c| {
                shares_path_prefix(&s.path, &c.path, PATH_PREFIX_SEGMENTS)
            }),
        ];

        for (tier, predicate) in steps {
            let mut narrowed: Vec<ConceptDefinition> = candidates
                .iter()
                .filter(|c| predicate(source, c))
                .cloned()
                .collect();

            match narrowed.len() {
                0 => {}
                1 => {
                    debug!(
                        "Resolved {} ({}) of entity {} via {} among {} candidates",
                        source.concept, source.path, source.entity, tier, total
                    );
                    return Resolution {
                        target: narrowed.remove(0),
                        tier,
                        candidates: total,
                    };
                }
                _ => candidates = narrowed,
            }
        }

        let remaining = candidates.len();
        let target = candidates.remove(0);
        warn!(
            "Ambiguous match for {} ({}) of entity {}: {} candidates remain, using {} ({})",
            source.concept, source.path, source.entity, remaining, target.id, target.path
        );
        Resolution {
            target,
            tier: ResolverTier::FirstCandidate,
            candidates: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cadence, ConceptId, ConceptKind, EntityId, StatementCategory};
    use crate::store::MemoryStore;

    fn entity() -> EntityId {
        EntityId::new("0001326801")
    }

    fn def(
        id: u64,
        cadence: Cadence,
        concept: &str,
        label: &str,
        path: &str,
        parent: Option<u64>,
    ) -> ConceptDefinition {
        ConceptDefinition {
            id: ConceptId(id),
            entity: entity(),
            statement: StatementCategory::IncomeStatement,
            cadence,
            concept: concept.to_string(),
            label: label.to_string(),
            path: path.to_string(),
            kind: match parent {
                Some(p) => ConceptKind::Dimensional {
                    parent: ConceptId(p),
                },
                None => ConceptKind::Plain,
            },
        }
    }

    fn store_with(defs: Vec<ConceptDefinition>) -> MemoryStore {
        let store = MemoryStore::new();
        for d in defs {
            store.add_concept(d).unwrap();
        }
        store
    }

    #[test]
    fn test_exact_identity() {
        let q = def(1, Cadence::Quarterly, "us-gaap:Revenues", "Revenue", "001", None);
        let a = def(2, Cadence::Annual, "us-gaap:Revenues", "Total revenue", "002", None);
        let store = store_with(vec![q.clone(), a]);

        let resolution = ConceptResolver::new(&store).resolve(&q).unwrap().unwrap();
        assert_eq!(resolution.target.id, ConceptId(2));
        assert_eq!(resolution.tier, ResolverTier::ExactIdentity);
        assert!(!resolution.tier.is_fallback());
    }

    #[test]
    fn test_dimensional_flag_must_agree() {
        let q = def(1, Cadence::Quarterly, "us-gaap:Revenues", "", "001", None);
        let a = def(2, Cadence::Annual, "us-gaap:Revenues", "", "001.001", Some(3));
        let store = store_with(vec![q.clone(), a]);

        assert!(ConceptResolver::new(&store).resolve(&q).unwrap().is_none());
    }

    #[test]
    fn test_parent_relationship_disambiguates_same_member() {
        // FamilyOfAppsMember appears under Revenue and under Operating income in
        // both cadences, at different positions.
        let store = store_with(vec![
            def(10, Cadence::Quarterly, "us-gaap:Revenues", "", "001", None),
            def(11, Cadence::Quarterly, "us-gaap:OperatingIncomeLoss", "", "003", None),
            def(12, Cadence::Quarterly, "meta:FamilyOfAppsMember", "Family of Apps", "001.002.001", Some(10)),
            def(13, Cadence::Quarterly, "meta:FamilyOfAppsMember", "Family of Apps", "003.001", Some(11)),
            def(20, Cadence::Annual, "us-gaap:Revenues", "", "001", None),
            def(21, Cadence::Annual, "us-gaap:OperatingIncomeLoss", "", "004", None),
            def(22, Cadence::Annual, "meta:FamilyOfAppsMember", "Family of Apps", "004.001", Some(21)),
            def(23, Cadence::Annual, "meta:FamilyOfAppsMember", "Family of Apps", "001.001", Some(20)),
        ]);
        let resolver = ConceptResolver::new(&store);

        let under_revenue = def(12, Cadence::Quarterly, "meta:FamilyOfAppsMember", "Family of Apps", "001.002.001", Some(10));
        let r = resolver.resolve(&under_revenue).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(23));
        assert_eq!(r.tier, ResolverTier::ParentRelationship);
        assert_eq!(r.candidates, 2);

        let under_operating = def(13, Cadence::Quarterly, "meta:FamilyOfAppsMember", "Family of Apps", "003.001", Some(11));
        let r = resolver.resolve(&under_operating).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(22));
        assert_eq!(r.tier, ResolverTier::ParentRelationship);
    }

    #[test]
    fn test_path_fallback_order() {
        let q = def(1, Cadence::Quarterly, "custom:Segment", "Streaming", "002.001", None);
        let store = store_with(vec![
            q.clone(),
            def(5, Cadence::Annual, "custom:Segment", "DVD", "002.001", None),
            def(6, Cadence::Annual, "custom:Segment", "Streaming", "002.002", None),
        ]);

        let r = ConceptResolver::new(&store).resolve(&q).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(5));
        assert_eq!(r.tier, ResolverTier::ExactPath);
        assert!(r.tier.is_fallback());
    }

    #[test]
    fn test_label_then_prefix_fallback() {
        let q = def(1, Cadence::Quarterly, "custom:Segment", "Streaming", "002.001.004", None);
        let store = store_with(vec![
            q.clone(),
            def(5, Cadence::Annual, "custom:Segment", "DVD", "009.001", None),
            def(6, Cadence::Annual, "custom:Segment", "Streaming", "002.003", None),
        ]);
        let r = ConceptResolver::new(&store).resolve(&q).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(6));
        assert_eq!(r.tier, ResolverTier::ExactLabel);

        let q = def(1, Cadence::Quarterly, "custom:Segment", "", "002.001.004", None);
        let store = store_with(vec![
            q.clone(),
            def(5, Cadence::Annual, "custom:Segment", "DVD", "009.001", None),
            def(6, Cadence::Annual, "custom:Segment", "Streaming", "002.001.009", None),
        ]);
        let r = ConceptResolver::new(&store).resolve(&q).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(6));
        assert_eq!(r.tier, ResolverTier::PathPrefix);
    }

    #[test]
    fn test_first_candidate_is_lowest_id() {
        let q = def(1, Cadence::Quarterly, "custom:Segment", "", "007", None);
        let store = store_with(vec![
            q.clone(),
            def(9, Cadence::Annual, "custom:Segment", "B", "008", None),
            def(4, Cadence::Annual, "custom:Segment", "A", "009", None),
        ]);

        let r = ConceptResolver::new(&store).resolve(&q).unwrap().unwrap();
        assert_eq!(r.target.id, ConceptId(4));
        assert_eq!(r.tier, ResolverTier::FirstCandidate);
        assert_eq!(r.candidates, 2);
    }
}
