use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{
    EntryGroupRef, QueryParameters, Rank, ResolutionAttempt, ResolutionStatus,
};
use crate::planner::{PlanOutcome, QueryPlanner};
use crate::verifier::{canonical_kingdom, extract_classification, MatchType, VerifierMatch};

/// Everything a classification case may inspect: the attempt under
/// classification, its group's source data, the full attempt chain (oldest
/// first, current attempt last), and the planner for retry escalation.
pub struct CaseContext<'a> {
    pub attempt: &'a ResolutionAttempt,
    pub group: &'a EntryGroupRef,
    pub chain: &'a [&'a ResolutionAttempt],
    pub planner: &'a QueryPlanner,
}

/// The single new attempt a claiming case produces: either terminal or a
/// scheduled retry carrying the planner's next query.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub status: ResolutionStatus,
    pub resolved_classification: Option<BTreeMap<Rank, String>>,
    pub failure_reason: Option<String>,
    pub scheduled_query: Option<QueryParameters>,
    pub metadata: BTreeMap<String, String>,
}

impl CaseOutcome {
    fn terminal(status: ResolutionStatus) -> Self {
        Self {
            status,
            resolved_classification: None,
            failure_reason: None,
            scheduled_query: None,
            metadata: BTreeMap::new(),
        }
    }
}

pub type ClassificationCase = fn(&CaseContext) -> Option<CaseOutcome>;

/// The ordered case list. First match wins; registration order is the
/// contract: conservative, correctness-favoring cases come before permissive
/// ones so a loose rule can never shadow a strict one.
pub const CASES: &[(&str, ClassificationCase)] = &[
    ("singular_exact_accepted", singular_exact_accepted),
    ("singular_fuzzy_accepted", singular_fuzzy_accepted),
    ("accepted_tie", accepted_tie),
    ("partial_match_reduced_rank", partial_match_reduced_rank),
    ("collaborator_error_retry", collaborator_error_retry),
    ("no_match_retry", no_match_retry),
];

/// Run the case pipeline for one attempt. An attempt no case claims is an
/// implicit non-match and is routed to the retry path.
pub fn classify(ctx: &CaseContext) -> (&'static str, CaseOutcome) {
    for (name, case) in CASES {
        if let Some(outcome) = case(ctx) {
            return (*name, outcome);
        }
    }
    ("unclassified_retry", schedule_retry(ctx, "no classification case matched"))
}

/// Every (rank, authority) pair already tried in this group's chain,
/// including the attempt currently under classification.
pub fn attempted_pairs(chain: &[&ResolutionAttempt]) -> BTreeSet<(Rank, u32)> {
    chain
        .iter()
        .map(|attempt| (attempt.query.rank, attempt.query.source_id))
        .collect()
}

/// Single exact accepted candidate from the queried authority whose
/// classification path matches every populated input rank, queried at the
/// group's most specific level.
fn singular_exact_accepted(ctx: &CaseContext) -> Option<CaseOutcome> {
    let candidate = sole_candidate(ctx)?;
    if candidate.match_type != MatchType::Exact {
        return None;
    }
    if !candidate.is_accepted() || candidate.data_source_id != ctx.attempt.query.source_id {
        return None;
    }
    if !queried_at_most_specific(ctx) {
        return None;
    }

    let classification = extract_classification(candidate);
    let depth = query_depth(ctx.attempt.query.rank);
    if !complete_to_depth(&classification, depth) {
        return None;
    }
    if !input_matches(&classification, ctx.group, depth) {
        return None;
    }

    let mut outcome = CaseOutcome::terminal(ResolutionStatus::ExactMatch);
    outcome.resolved_classification = Some(classification);
    Some(outcome)
}

/// Single accepted fuzzy candidate with a complete, input-consistent path.
fn singular_fuzzy_accepted(ctx: &CaseContext) -> Option<CaseOutcome> {
    let candidate = sole_candidate(ctx)?;
    if !matches!(
        candidate.match_type,
        MatchType::Fuzzy | MatchType::FuzzyRelaxed
    ) {
        return None;
    }
    if !candidate.is_accepted() || candidate.data_source_id != ctx.attempt.query.source_id {
        return None;
    }
    if !queried_at_most_specific(ctx) {
        return None;
    }

    let classification = extract_classification(candidate);
    let depth = query_depth(ctx.attempt.query.rank);
    if !complete_to_depth(&classification, depth) || !input_matches(&classification, ctx.group, depth)
    {
        return None;
    }

    let mut outcome = CaseOutcome::terminal(ResolutionStatus::FuzzyMatch);
    outcome.resolved_classification = Some(classification);
    outcome
        .metadata
        .insert("match_type".to_string(), "fuzzy".to_string());
    Some(outcome)
}

/// Two or more accepted candidates at equal match quality with no
/// distinguishing signal: terminate conservatively rather than pick one.
fn accepted_tie(ctx: &CaseContext) -> Option<CaseOutcome> {
    let response = ctx.attempt.response.as_ref()?;
    let accepted: Vec<&VerifierMatch> =
        response.results.iter().filter(|r| r.is_accepted()).collect();
    if accepted.len() < 2 {
        return None;
    }

    let best = accepted.iter().map(|r| match_quality(r.match_type)).max()?;
    let tied: Vec<&&VerifierMatch> = accepted
        .iter()
        .filter(|r| match_quality(r.match_type) == best)
        .collect();
    if tied.len() < 2 {
        return None;
    }

    let mut outcome = CaseOutcome::terminal(ResolutionStatus::AmbiguousTie);
    outcome.failure_reason = Some(format!(
        "{} equally ranked accepted matches for '{}' with no distinguishing signal",
        tied.len(),
        ctx.attempt.query.term
    ));
    outcome
        .metadata
        .insert("tied_candidates".to_string(), tied.len().to_string());
    Some(outcome)
}

/// A retry at a less specific rank that produced a single accepted candidate
/// consistent with the input down to that rank. The resolution is partial:
/// ranks below the queried level stay unresolved.
fn partial_match_reduced_rank(ctx: &CaseContext) -> Option<CaseOutcome> {
    if !ctx.attempt.is_retry() {
        return None;
    }
    let candidate = sole_candidate(ctx)?;
    if !matches!(
        candidate.match_type,
        MatchType::Exact | MatchType::Fuzzy | MatchType::FuzzyRelaxed
    ) {
        return None;
    }
    if !candidate.is_accepted() || candidate.data_source_id != ctx.attempt.query.source_id {
        return None;
    }

    let classification = extract_classification(candidate);
    let depth = query_depth(ctx.attempt.query.rank);
    if !complete_to_depth(&classification, depth) || !input_matches(&classification, ctx.group, depth)
    {
        return None;
    }

    let mut outcome = CaseOutcome::terminal(ResolutionStatus::PartialMatch);
    outcome.resolved_classification = Some(classification);
    outcome.metadata.insert(
        "resolved_depth".to_string(),
        depth.as_str().to_string(),
    );
    Some(outcome)
}

/// The executor recorded a collaborator-level error for this attempt; retry
/// along the deterministic escalation path.
fn collaborator_error_retry(ctx: &CaseContext) -> Option<CaseOutcome> {
    let error = ctx.attempt.error.as_deref()?;
    Some(schedule_retry(ctx, &format!("collaborator error: {error}")))
}

/// No candidates came back for the queried term.
fn no_match_retry(ctx: &CaseContext) -> Option<CaseOutcome> {
    match &ctx.attempt.response {
        Some(response) if !response.is_no_match() => None,
        _ => Some(schedule_retry(ctx, "no match for queried term")),
    }
}

fn schedule_retry(ctx: &CaseContext, reason: &str) -> CaseOutcome {
    let attempted = attempted_pairs(ctx.chain);
    match ctx
        .planner
        .plan_retry(ctx.group, &ctx.attempt.query, &attempted)
    {
        PlanOutcome::Query(next) => {
            let mut outcome = CaseOutcome {
                status: ResolutionStatus::RetryScheduled,
                resolved_classification: None,
                failure_reason: None,
                scheduled_query: Some(next),
                metadata: BTreeMap::new(),
            };
            outcome
                .metadata
                .insert("retry_reason".to_string(), reason.to_string());
            outcome
        }
        PlanOutcome::Exhausted => {
            let mut outcome = CaseOutcome::terminal(ResolutionStatus::RetriesExhausted);
            outcome.failure_reason = Some(format!(
                "retries exhausted across {} attempted rank/authority pairs; last: {reason}",
                attempted.len()
            ));
            outcome
        }
    }
}

fn sole_candidate<'a>(ctx: &'a CaseContext) -> Option<&'a VerifierMatch> {
    let response = ctx.attempt.response.as_ref()?;
    if ctx.attempt.error.is_some() || response.results.len() != 1 {
        return None;
    }
    response.results.first()
}

fn queried_at_most_specific(ctx: &CaseContext) -> bool {
    ctx.group
        .most_specific()
        .map(|(_, term)| term == ctx.attempt.query.term)
        .unwrap_or(false)
}

/// The classification depth a query at the given level is expected to cover.
fn query_depth(rank: Rank) -> Rank {
    match rank {
        Rank::ScientificName => Rank::Species,
        other => other,
    }
}

fn rank_index(rank: Rank) -> usize {
    Rank::CLASSIFICATION
        .iter()
        .position(|r| *r == rank)
        .unwrap_or(Rank::CLASSIFICATION.len() - 1)
}

fn complete_to_depth(classification: &BTreeMap<Rank, String>, depth: Rank) -> bool {
    Rank::CLASSIFICATION[..=rank_index(depth)]
        .iter()
        .all(|rank| classification.contains_key(rank))
}

/// Every populated input rank at or above the queried depth must agree with
/// the candidate's path, comparing case-insensitively with kingdom labels
/// canonicalized on both sides.
fn input_matches(
    classification: &BTreeMap<Rank, String>,
    group: &EntryGroupRef,
    depth: Rank,
) -> bool {
    for rank in &Rank::CLASSIFICATION[..=rank_index(depth)] {
        let Some(input) = group.taxonomy.populated(*rank) else {
            continue;
        };
        let Some(resolved) = classification.get(rank) else {
            return false;
        };
        let input = if *rank == Rank::Kingdom {
            canonical_kingdom(input)
        } else {
            input
        };
        if !input.eq_ignore_ascii_case(resolved.trim()) {
            return false;
        }
    }
    true
}

fn match_quality(match_type: MatchType) -> u8 {
    match match_type {
        MatchType::Exact | MatchType::ExactSpeciesGroup => 4,
        MatchType::Fuzzy | MatchType::FuzzySpeciesGroup => 3,
        MatchType::FuzzyRelaxed => 2,
        MatchType::PartialExact | MatchType::PartialFuzzy | MatchType::PartialFuzzyRelaxed => 1,
        MatchType::Virus | MatchType::FacetedSearch | MatchType::NoMatch => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Taxonomy;
    use crate::verifier::VerifiedName;

    fn group() -> EntryGroupRef {
        EntryGroupRef {
            key: "group".to_string(),
            entry_uuids: vec!["a".to_string()],
            taxonomy: Taxonomy {
                kingdom: Some("Animalia".to_string()),
                phylum: Some("Chordata".to_string()),
                class: Some("Mammalia".to_string()),
                order: Some("Carnivora".to_string()),
                family: Some("Felidae".to_string()),
                genus: Some("Puma".to_string()),
                species: Some("Puma concolor".to_string()),
            },
            scientific_name: None,
        }
    }

    fn candidate(match_type: MatchType, status: &str) -> VerifierMatch {
        VerifierMatch {
            data_source_id: 11,
            match_type,
            matched_name: Some("Puma concolor".to_string()),
            current_name: Some("Puma concolor".to_string()),
            taxonomic_status: Some(status.to_string()),
            classification_path: Some(
                "Animalia|Chordata|Mammalia|Carnivora|Felidae|Puma|Puma concolor".to_string(),
            ),
            classification_ranks: Some(
                "kingdom|phylum|class|order|family|genus|species".to_string(),
            ),
        }
    }

    fn attempt(
        query: QueryParameters,
        results: Vec<VerifierMatch>,
        error: Option<&str>,
        previous: Option<&str>,
    ) -> ResolutionAttempt {
        let match_type = if results.is_empty() {
            MatchType::NoMatch
        } else {
            results[0].match_type
        };
        ResolutionAttempt {
            id: "attempt".to_string(),
            group_key: "group".to_string(),
            query: query.clone(),
            status: ResolutionStatus::Processing,
            response: Some(VerifiedName {
                name: query.term,
                match_type,
                results,
                error: None,
            }),
            resolved_classification: None,
            error: error.map(str::to_string),
            failure_reason: None,
            case_name: None,
            previous_attempt_id: previous.map(str::to_string),
            scheduled_query: None,
            metadata: BTreeMap::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn species_query() -> QueryParameters {
        QueryParameters {
            term: "Puma concolor".to_string(),
            rank: Rank::Species,
            source_id: 11,
        }
    }

    #[test]
    fn exact_accepted_single_result_succeeds() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let attempt = attempt(
            species_query(),
            vec![candidate(MatchType::Exact, "Accepted")],
            None,
            None,
        );
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        assert_eq!(name, "singular_exact_accepted");
        assert_eq!(outcome.status, ResolutionStatus::ExactMatch);
        let classification = outcome.resolved_classification.unwrap();
        assert_eq!(
            classification.get(&Rank::Species).map(String::as_str),
            Some("Puma concolor")
        );
    }

    #[test]
    fn synonym_only_result_is_not_claimed_by_exact_case() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let attempt = attempt(
            species_query(),
            vec![candidate(MatchType::Exact, "Synonym")],
            None,
            None,
        );
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        // Falls through the success cases into the implicit retry path.
        assert_eq!(name, "unclassified_retry");
        assert_eq!(outcome.status, ResolutionStatus::RetryScheduled);
    }

    #[test]
    fn equally_ranked_accepted_matches_are_a_tie() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let attempt = attempt(
            species_query(),
            vec![
                candidate(MatchType::Exact, "Accepted"),
                candidate(MatchType::Exact, "Accepted"),
            ],
            None,
            None,
        );
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        assert_eq!(name, "accepted_tie");
        assert_eq!(outcome.status, ResolutionStatus::AmbiguousTie);
        assert!(outcome.failure_reason.unwrap().contains("2 equally ranked"));
    }

    #[test]
    fn strictly_better_candidate_is_not_a_tie() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let attempt = attempt(
            species_query(),
            vec![
                candidate(MatchType::Exact, "Accepted"),
                candidate(MatchType::Fuzzy, "Accepted"),
            ],
            None,
            None,
        );
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        assert!(accepted_tie(&ctx).is_none());
    }

    #[test]
    fn no_match_schedules_retry_at_next_rank() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let attempt = attempt(species_query(), Vec::new(), None, None);
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        assert_eq!(name, "no_match_retry");
        assert_eq!(outcome.status, ResolutionStatus::RetryScheduled);
        let next = outcome.scheduled_query.unwrap();
        assert_eq!(next.rank, Rank::Genus);
        assert_eq!(next.term, "Puma");
        assert_eq!(next.source_id, 11);
    }

    #[test]
    fn collaborator_error_schedules_retry_before_no_match() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let mut failed = attempt(species_query(), Vec::new(), Some("simulated timeout"), None);
        failed.response = None;
        let chain = [&failed];
        let ctx = CaseContext {
            attempt: &failed,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        assert_eq!(name, "collaborator_error_retry");
        assert_eq!(outcome.status, ResolutionStatus::RetryScheduled);
        assert!(
            outcome.metadata.get("retry_reason").unwrap().contains("simulated timeout")
        );
    }

    #[test]
    fn exhausted_search_space_terminates_with_failure() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let mut group = group();
        // Only one populated level: species. A no-match at species exhausts
        // the single-authority search space immediately.
        group.taxonomy = Taxonomy {
            species: Some("Puma concolor".to_string()),
            ..Taxonomy::default()
        };
        let attempt = attempt(species_query(), Vec::new(), None, None);
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (_, outcome) = classify(&ctx);
        assert_eq!(outcome.status, ResolutionStatus::RetriesExhausted);
        assert!(outcome.failure_reason.is_some());
    }

    #[test]
    fn reduced_rank_retry_yields_partial_match() {
        let planner = QueryPlanner::new(vec![11]).unwrap();
        let group = group();
        let family_query = QueryParameters {
            term: "Felidae".to_string(),
            rank: Rank::Family,
            source_id: 11,
        };
        let mut family_candidate = candidate(MatchType::Exact, "Accepted");
        family_candidate.classification_path =
            Some("Animalia|Chordata|Mammalia|Carnivora|Felidae".to_string());
        family_candidate.classification_ranks =
            Some("kingdom|phylum|class|order|family".to_string());
        let attempt = attempt(family_query, vec![family_candidate], None, Some("prev"));
        let chain = [&attempt];
        let ctx = CaseContext {
            attempt: &attempt,
            group: &group,
            chain: &chain,
            planner: &planner,
        };

        let (name, outcome) = classify(&ctx);
        assert_eq!(name, "partial_match_reduced_rank");
        assert_eq!(outcome.status, ResolutionStatus::PartialMatch);
        let classification = outcome.resolved_classification.unwrap();
        assert!(!classification.contains_key(&Rank::Species));
        assert_eq!(
            classification.get(&Rank::Family).map(String::as_str),
            Some("Felidae")
        );
    }
}
