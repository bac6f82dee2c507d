use assert_matches::assert_matches;
use taxoresolve::domain::{
    Rank, ResolutionStatus, StatusCategory, TaxonomicEntry, Taxonomy,
};
use taxoresolve::error::TaxoError;
use taxoresolve::grouper::group_key;

#[test]
fn rank_parsing_round_trips() {
    for rank in Rank::QUERY_PRECEDENCE {
        let parsed: Rank = rank.as_str().parse().unwrap();
        assert_eq!(parsed, rank);
    }
    let err = "tribe".parse::<Rank>().unwrap_err();
    assert_matches!(err, TaxoError::InvalidRank(_));
}

#[test]
fn entry_serde_accepts_sparse_records() {
    let entry: TaxonomicEntry = serde_json::from_str(
        r#"{"uuid":"u1","class":"Mammalia","common_name":"cougar"}"#,
    )
    .unwrap();
    assert_eq!(entry.taxonomy.class.as_deref(), Some("Mammalia"));
    assert!(entry.taxonomy.kingdom.is_none());
    assert!(entry.has_taxonomic_data());

    let empty: TaxonomicEntry = serde_json::from_str(r#"{"uuid":"u2"}"#).unwrap();
    assert!(!empty.has_taxonomic_data());
}

#[test]
fn group_keys_are_pure_functions_of_normalized_data() {
    let upper = Taxonomy {
        species: Some("Puma Concolor".to_string()),
        ..Taxonomy::default()
    };
    let lower = Taxonomy {
        species: Some("puma concolor".to_string()),
        ..Taxonomy::default()
    };
    assert_eq!(group_key(&upper, None), group_key(&lower, None));
    assert_ne!(group_key(&upper, None), group_key(&upper, Some("Puma")));
}

#[test]
fn terminal_statuses_close_a_group() {
    let terminal = [
        ResolutionStatus::ExactMatch,
        ResolutionStatus::FuzzyMatch,
        ResolutionStatus::PartialMatch,
        ResolutionStatus::ForceAccepted,
        ResolutionStatus::EmptyInputTaxonomy,
        ResolutionStatus::ForcedIncomplete,
        ResolutionStatus::AmbiguousTie,
        ResolutionStatus::RetriesExhausted,
    ];
    for status in terminal {
        assert!(status.is_terminal(), "{status} should be terminal");
    }
    assert_eq!(
        ResolutionStatus::Processing.category(),
        StatusCategory::Processing
    );
    assert_eq!(ResolutionStatus::EmptyInputTaxonomy.to_string(), "EMPTY_INPUT_TAXONOMY");
}
