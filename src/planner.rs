use std::collections::BTreeSet;

use crate::domain::{EntryGroupRef, QueryParameters, Rank};
use crate::error::TaxoError;

/// Outcome of retry planning: either the next query to run or proof that the
/// rank-by-authority search space is used up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Query(QueryParameters),
    Exhausted,
}

/// Derives the next query for a group from its data and attempt history.
///
/// Escalation is deterministic: all populated ranks of one authority, most
/// specific first, then the next authority in the precedence list starting
/// over at the most specific rank. A (rank, authority) pair is never planned
/// twice for the same group, which bounds any group's chain to at most
/// ranks x authorities query attempts.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    authorities: Vec<u32>,
}

impl QueryPlanner {
    pub fn new(authorities: Vec<u32>) -> Result<Self, TaxoError> {
        if authorities.is_empty() {
            return Err(TaxoError::EmptyAuthorityList);
        }
        Ok(Self { authorities })
    }

    pub fn primary_authority(&self) -> u32 {
        self.authorities[0]
    }

    pub fn authorities(&self) -> &[u32] {
        &self.authorities
    }

    /// Initial query: the group's most specific populated level against the
    /// highest-priority authority. `None` only for the empty group, which the
    /// manager short-circuits before planning.
    pub fn plan_initial(&self, group: &EntryGroupRef) -> Option<QueryParameters> {
        let (rank, term) = group.most_specific()?;
        Some(QueryParameters {
            term: term.to_string(),
            rank,
            source_id: self.primary_authority(),
        })
    }

    /// Next escalation step after a failed attempt: first the remaining
    /// less-specific populated ranks under the same authority, then the next
    /// authority restarting at the most specific populated rank.
    pub fn plan_retry(
        &self,
        group: &EntryGroupRef,
        last: &QueryParameters,
        attempted: &BTreeSet<(Rank, u32)>,
    ) -> PlanOutcome {
        let last_position = Rank::QUERY_PRECEDENCE
            .iter()
            .position(|rank| *rank == last.rank)
            .unwrap_or(0);

        for rank in &Rank::QUERY_PRECEDENCE[last_position + 1..] {
            if attempted.contains(&(*rank, last.source_id)) {
                continue;
            }
            if let Some(term) = group.populated_term(*rank) {
                return PlanOutcome::Query(QueryParameters {
                    term: term.to_string(),
                    rank: *rank,
                    source_id: last.source_id,
                });
            }
        }

        let source_position = self
            .authorities
            .iter()
            .position(|source| *source == last.source_id)
            .unwrap_or(0);

        for source_id in &self.authorities[source_position + 1..] {
            for rank in &Rank::QUERY_PRECEDENCE {
                if attempted.contains(&(*rank, *source_id)) {
                    continue;
                }
                if let Some(term) = group.populated_term(*rank) {
                    return PlanOutcome::Query(QueryParameters {
                        term: term.to_string(),
                        rank: *rank,
                        source_id: *source_id,
                    });
                }
            }
        }

        PlanOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Taxonomy;

    fn group() -> EntryGroupRef {
        EntryGroupRef {
            key: "k".to_string(),
            entry_uuids: vec!["a".to_string()],
            taxonomy: Taxonomy {
                kingdom: Some("Animalia".to_string()),
                family: Some("Felidae".to_string()),
                genus: Some("Puma".to_string()),
                species: Some("Puma concolor".to_string()),
                ..Taxonomy::default()
            },
            scientific_name: None,
        }
    }

    #[test]
    fn initial_plan_uses_most_specific_rank_and_primary_authority() {
        let planner = QueryPlanner::new(vec![11, 172]).unwrap();
        let query = planner.plan_initial(&group()).unwrap();
        assert_eq!(query.term, "Puma concolor");
        assert_eq!(query.rank, Rank::Species);
        assert_eq!(query.source_id, 11);
    }

    #[test]
    fn retry_escalates_ranks_before_switching_authority() {
        let planner = QueryPlanner::new(vec![11, 172]).unwrap();
        let group = group();
        let mut attempted = BTreeSet::new();

        let mut last = planner.plan_initial(&group).unwrap();
        attempted.insert((last.rank, last.source_id));

        let expected = [
            (Rank::Genus, 11),
            (Rank::Family, 11),
            (Rank::Kingdom, 11),
            (Rank::Species, 172),
            (Rank::Genus, 172),
            (Rank::Family, 172),
            (Rank::Kingdom, 172),
        ];
        for (rank, source_id) in expected {
            let outcome = planner.plan_retry(&group, &last, &attempted);
            let PlanOutcome::Query(query) = outcome else {
                panic!("expected another query before exhaustion");
            };
            assert_eq!((query.rank, query.source_id), (rank, source_id));
            attempted.insert((query.rank, query.source_id));
            last = query;
        }

        assert_eq!(
            planner.plan_retry(&group, &last, &attempted),
            PlanOutcome::Exhausted
        );
    }

    #[test]
    fn retry_never_revisits_attempted_pairs() {
        let planner = QueryPlanner::new(vec![11, 172, 1]).unwrap();
        let group = group();
        let mut attempted = BTreeSet::new();
        let mut last = planner.plan_initial(&group).unwrap();
        attempted.insert((last.rank, last.source_id));

        let mut steps = 0usize;
        loop {
            match planner.plan_retry(&group, &last, &attempted) {
                PlanOutcome::Query(query) => {
                    let pair = (query.rank, query.source_id);
                    assert!(attempted.insert(pair), "revisited {pair:?}");
                    last = query;
                    steps += 1;
                    assert!(steps <= Rank::QUERY_PRECEDENCE.len() * 3);
                }
                PlanOutcome::Exhausted => break,
            }
        }
        // 4 populated levels x 3 authorities, minus the initial query.
        assert_eq!(steps, 11);
    }

    #[test]
    fn empty_authority_list_is_rejected() {
        assert!(QueryPlanner::new(Vec::new()).is_err());
    }
}
