use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TaxoError;

/// Field values treated as absent during normalization and fingerprinting.
pub const PLACEHOLDER_VALUES: &[&str] = &["", "unknown", "null", "none", "n/a"];

/// A queryable taxonomic level. `ScientificName` is not one of the seven
/// classification ranks but sits between species and genus in query
/// precedence, since free-text names are usually binomials.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    ScientificName,
}

impl Rank {
    /// The seven classification ranks, most general first.
    pub const CLASSIFICATION: [Rank; 7] = [
        Rank::Kingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
    ];

    /// Query precedence, most specific first.
    pub const QUERY_PRECEDENCE: [Rank; 8] = [
        Rank::Species,
        Rank::ScientificName,
        Rank::Genus,
        Rank::Family,
        Rank::Order,
        Rank::Class,
        Rank::Phylum,
        Rank::Kingdom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Kingdom => "kingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::ScientificName => "scientific_name",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Rank {
    type Err = TaxoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "kingdom" => Ok(Rank::Kingdom),
            "phylum" => Ok(Rank::Phylum),
            "class" => Ok(Rank::Class),
            "order" => Ok(Rank::Order),
            "family" => Ok(Rank::Family),
            "genus" => Ok(Rank::Genus),
            "species" => Ok(Rank::Species),
            "scientific_name" | "scientificname" => Ok(Rank::ScientificName),
            other => Err(TaxoError::InvalidRank(other.to_string())),
        }
    }
}

/// The seven Linnaean rank fields of one record, each present-or-absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default)]
    pub kingdom: Option<String>,
    #[serde(default)]
    pub phylum: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub genus: Option<String>,
    #[serde(default)]
    pub species: Option<String>,
}

impl Taxonomy {
    pub fn rank(&self, rank: Rank) -> Option<&str> {
        let value = match rank {
            Rank::Kingdom => &self.kingdom,
            Rank::Phylum => &self.phylum,
            Rank::Class => &self.class,
            Rank::Order => &self.order,
            Rank::Family => &self.family,
            Rank::Genus => &self.genus,
            Rank::Species => &self.species,
            Rank::ScientificName => return None,
        };
        value.as_deref()
    }

    /// Rank value with placeholders treated as absent.
    pub fn populated(&self, rank: Rank) -> Option<&str> {
        self.rank(rank).map(str::trim).filter(|v| !is_placeholder(v))
    }

    pub fn is_empty(&self) -> bool {
        Rank::CLASSIFICATION
            .iter()
            .all(|rank| self.populated(*rank).is_none())
    }
}

pub fn is_placeholder(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    PLACEHOLDER_VALUES.contains(&lowered.as_str())
}

/// One input record. Created once at parse time and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomicEntry {
    pub uuid: String,
    #[serde(flatten)]
    pub taxonomy: Taxonomy,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub source_dataset: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl TaxonomicEntry {
    pub fn populated_scientific_name(&self) -> Option<&str> {
        self.scientific_name
            .as_deref()
            .map(str::trim)
            .filter(|v| !is_placeholder(v))
    }

    pub fn has_taxonomic_data(&self) -> bool {
        !self.taxonomy.is_empty() || self.populated_scientific_name().is_some()
    }
}

/// A set of entries sharing an identical taxonomic fingerprint. The shared
/// taxonomy is stored directly so downstream stages never need an entry
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryGroupRef {
    pub key: String,
    pub entry_uuids: Vec<String>,
    pub taxonomy: Taxonomy,
    #[serde(default)]
    pub scientific_name: Option<String>,
}

impl EntryGroupRef {
    pub fn member_count(&self) -> usize {
        self.entry_uuids.len()
    }

    pub fn populated_term(&self, rank: Rank) -> Option<&str> {
        match rank {
            Rank::ScientificName => self
                .scientific_name
                .as_deref()
                .map(str::trim)
                .filter(|v| !is_placeholder(v)),
            other => self.taxonomy.populated(other),
        }
    }

    /// Most specific populated level in query precedence order.
    pub fn most_specific(&self) -> Option<(Rank, &str)> {
        Rank::QUERY_PRECEDENCE
            .iter()
            .find_map(|rank| self.populated_term(*rank).map(|term| (*rank, term)))
    }

    /// True when no rank field and no name is populated. Such groups are
    /// short-circuited to a terminal failure without ever being queried.
    pub fn is_empty(&self) -> bool {
        self.most_specific().is_none()
    }
}

/// One concrete request shape: term, target rank, authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameters {
    pub term: String,
    pub rank: Rank,
    pub source_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Processing,
    RetryScheduled,
    Success,
    Failure,
}

/// Fine-grained outcome classification of a resolution attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Processing,
    RetryScheduled,
    ExactMatch,
    FuzzyMatch,
    PartialMatch,
    ForceAccepted,
    EmptyInputTaxonomy,
    ForcedIncomplete,
    AmbiguousTie,
    RetriesExhausted,
}

impl ResolutionStatus {
    pub fn category(&self) -> StatusCategory {
        match self {
            ResolutionStatus::Processing => StatusCategory::Processing,
            ResolutionStatus::RetryScheduled => StatusCategory::RetryScheduled,
            ResolutionStatus::ExactMatch
            | ResolutionStatus::FuzzyMatch
            | ResolutionStatus::PartialMatch
            | ResolutionStatus::ForceAccepted => StatusCategory::Success,
            ResolutionStatus::EmptyInputTaxonomy
            | ResolutionStatus::ForcedIncomplete
            | ResolutionStatus::AmbiguousTie
            | ResolutionStatus::RetriesExhausted => StatusCategory::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            StatusCategory::Success | StatusCategory::Failure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Processing => "PROCESSING",
            ResolutionStatus::RetryScheduled => "RETRY_SCHEDULED",
            ResolutionStatus::ExactMatch => "EXACT_MATCH",
            ResolutionStatus::FuzzyMatch => "FUZZY_MATCH",
            ResolutionStatus::PartialMatch => "PARTIAL_MATCH",
            ResolutionStatus::ForceAccepted => "FORCE_ACCEPTED",
            ResolutionStatus::EmptyInputTaxonomy => "EMPTY_INPUT_TAXONOMY",
            ResolutionStatus::ForcedIncomplete => "FORCED_INCOMPLETE",
            ResolutionStatus::AmbiguousTie => "AMBIGUOUS_TIE",
            ResolutionStatus::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step in a group's resolution history. Append-only; chains are simple
/// paths built via `previous_attempt_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    pub id: String,
    pub group_key: String,
    pub query: QueryParameters,
    pub status: ResolutionStatus,
    #[serde(default)]
    pub response: Option<crate::verifier::VerifiedName>,
    #[serde(default)]
    pub resolved_classification: Option<BTreeMap<Rank, String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub case_name: Option<String>,
    #[serde(default)]
    pub previous_attempt_id: Option<String>,
    #[serde(default)]
    pub scheduled_query: Option<QueryParameters>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: String,
}

impl ResolutionAttempt {
    pub fn is_retry(&self) -> bool {
        self.previous_attempt_id.is_some()
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_rank_valid() {
        let rank: Rank = " Class ".parse().unwrap();
        assert_eq!(rank, Rank::Class);
        assert_eq!(rank.as_str(), "class");
    }

    #[test]
    fn parse_rank_invalid() {
        let err = "subfamily".parse::<Rank>().unwrap_err();
        assert_matches!(err, TaxoError::InvalidRank(_));
    }

    #[test]
    fn placeholder_values_are_absent() {
        let taxonomy = Taxonomy {
            kingdom: Some("Animalia".to_string()),
            genus: Some("unknown".to_string()),
            species: Some("  ".to_string()),
            ..Taxonomy::default()
        };
        assert_eq!(taxonomy.populated(Rank::Kingdom), Some("Animalia"));
        assert_eq!(taxonomy.populated(Rank::Genus), None);
        assert_eq!(taxonomy.populated(Rank::Species), None);
        assert!(!taxonomy.is_empty());
    }

    #[test]
    fn most_specific_prefers_species_then_name() {
        let group = EntryGroupRef {
            key: "k".to_string(),
            entry_uuids: vec!["a".to_string()],
            taxonomy: Taxonomy {
                genus: Some("Puma".to_string()),
                species: Some("Puma concolor".to_string()),
                ..Taxonomy::default()
            },
            scientific_name: Some("Puma concolor".to_string()),
        };
        assert_eq!(
            group.most_specific(),
            Some((Rank::Species, "Puma concolor"))
        );

        let group = EntryGroupRef {
            key: "k".to_string(),
            entry_uuids: vec!["a".to_string()],
            taxonomy: Taxonomy {
                genus: Some("Puma".to_string()),
                ..Taxonomy::default()
            },
            scientific_name: Some("Puma concolor".to_string()),
        };
        assert_eq!(
            group.most_specific(),
            Some((Rank::ScientificName, "Puma concolor"))
        );
    }

    #[test]
    fn status_categories() {
        assert_eq!(
            ResolutionStatus::Processing.category(),
            StatusCategory::Processing
        );
        assert_eq!(
            ResolutionStatus::RetryScheduled.category(),
            StatusCategory::RetryScheduled
        );
        assert!(ResolutionStatus::ExactMatch.is_terminal());
        assert!(ResolutionStatus::AmbiguousTie.is_terminal());
        assert!(!ResolutionStatus::RetryScheduled.is_terminal());
    }

    #[test]
    fn sha256_hex_is_stable() {
        let digest = sha256_hex(b"puma concolor");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_hex(b"puma concolor"));
    }
}
