use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::cases::{classify, CaseContext, CaseOutcome};
use crate::domain::{
    sha256_hex, EntryGroupRef, QueryParameters, Rank, ResolutionAttempt, ResolutionStatus,
};
use crate::error::TaxoError;
use crate::executor::{QueryExecutor, QueryOutcome};
use crate::planner::QueryPlanner;
use crate::verifier::{VerifiedName, VerifierClient};

/// Input for one append-only attempt record. The manager fills in identity,
/// chain linkage, and the timestamp.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub group_key: String,
    pub query: QueryParameters,
    pub status: ResolutionStatus,
    pub response: Option<VerifiedName>,
    pub resolved_classification: Option<BTreeMap<Rank, String>>,
    pub error: Option<String>,
    pub failure_reason: Option<String>,
    pub case_name: Option<String>,
    pub scheduled_query: Option<QueryParameters>,
    pub metadata: BTreeMap<String, String>,
}

impl NewAttempt {
    pub fn bare(group_key: String, query: QueryParameters, status: ResolutionStatus) -> Self {
        Self {
            group_key,
            query,
            status,
            response: None,
            resolved_classification: None,
            error: None,
            failure_reason: None,
            case_name: None,
            scheduled_query: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Append-only store of resolution attempts, partitioned by group key. The
/// sole mutator of attempt state; chains never branch because a predecessor
/// is always the group's current head.
#[derive(Debug, Default)]
pub struct AttemptManager {
    attempts: HashMap<String, ResolutionAttempt>,
    latest: BTreeMap<String, String>,
}

impl AttemptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a manager from persisted attempts. The head of each group's
    /// chain is the attempt no other attempt references as its predecessor.
    pub fn from_attempts(attempts: Vec<ResolutionAttempt>) -> Self {
        let referenced: HashSet<String> = attempts
            .iter()
            .filter_map(|attempt| attempt.previous_attempt_id.clone())
            .collect();
        let mut manager = Self::new();
        for attempt in attempts {
            if !referenced.contains(&attempt.id) {
                manager
                    .latest
                    .insert(attempt.group_key.clone(), attempt.id.clone());
            }
            manager.attempts.insert(attempt.id.clone(), attempt);
        }
        manager
    }

    /// Record a new attempt, linked to the group's current chain head. The
    /// attempt id is a deterministic hash over the group key, the
    /// predecessor id, the query parameters, the status tag, and the
    /// response digest, so identical runs produce identical chains.
    pub fn record(&mut self, new: NewAttempt) -> String {
        let previous_attempt_id = self.latest.get(&new.group_key).cloned();
        if let Some(previous) = previous_attempt_id.as_deref().and_then(|id| self.attempts.get(id))
        {
            debug_assert!(
                !previous.status.is_terminal(),
                "group {} is closed; no further attempts may be recorded",
                new.group_key
            );
        }

        let digest = response_digest(new.response.as_ref(), new.error.as_deref());
        let identity = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            new.group_key,
            previous_attempt_id.as_deref().unwrap_or(""),
            new.query.term,
            new.query.rank,
            new.query.source_id,
            new.status.as_str(),
            digest,
        );
        let id = sha256_hex(identity.as_bytes());

        let attempt = ResolutionAttempt {
            id: id.clone(),
            group_key: new.group_key.clone(),
            query: new.query,
            status: new.status,
            response: new.response,
            resolved_classification: new.resolved_classification,
            error: new.error,
            failure_reason: new.failure_reason,
            case_name: new.case_name,
            previous_attempt_id,
            scheduled_query: new.scheduled_query,
            metadata: new.metadata,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.attempts.insert(id.clone(), attempt);
        self.latest.insert(new.group_key, id.clone());
        id
    }

    pub fn get(&self, attempt_id: &str) -> Option<&ResolutionAttempt> {
        self.attempts.get(attempt_id)
    }

    pub fn latest(&self, group_key: &str) -> Option<&ResolutionAttempt> {
        self.latest
            .get(group_key)
            .and_then(|id| self.attempts.get(id))
    }

    /// Full chain for a group via backward walk, returned oldest first.
    pub fn chain(&self, group_key: &str) -> Vec<&ResolutionAttempt> {
        let mut chain = Vec::new();
        let mut current = self.latest.get(group_key).map(String::as_str);
        while let Some(id) = current {
            let Some(attempt) = self.attempts.get(id) else {
                break;
            };
            chain.push(attempt);
            current = attempt.previous_attempt_id.as_deref();
        }
        chain.reverse();
        chain
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn group_count(&self) -> usize {
        self.latest.len()
    }

    pub fn group_keys(&self) -> impl Iterator<Item = &String> {
        self.latest.keys()
    }

    /// Counts of each group's head status.
    pub fn status_counts(&self) -> BTreeMap<ResolutionStatus, usize> {
        let mut counts = BTreeMap::new();
        for id in self.latest.values() {
            if let Some(attempt) = self.attempts.get(id) {
                *counts.entry(attempt.status).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Deterministic dump for persistence: groups in key order, each chain
    /// oldest first.
    pub fn snapshot(&self) -> Vec<ResolutionAttempt> {
        let mut dump = Vec::with_capacity(self.attempts.len());
        for group_key in self.latest.keys() {
            for attempt in self.chain(group_key) {
                dump.push(attempt.clone());
            }
        }
        dump
    }
}

fn response_digest(response: Option<&VerifiedName>, error: Option<&str>) -> String {
    let serialized = response
        .and_then(|name| serde_json::to_string(name).ok())
        .unwrap_or_default();
    sha256_hex(format!("{serialized}|{}", error.unwrap_or("")).as_bytes())
}

/// Drives the plan -> execute -> classify loop to fixpoint over
/// bulk-synchronous rounds. Classification within a round runs in parallel;
/// rounds themselves are strictly sequential.
pub struct ResolutionEngine<'a, V: VerifierClient> {
    planner: QueryPlanner,
    executor: QueryExecutor<'a, V>,
}

impl<'a, V: VerifierClient> ResolutionEngine<'a, V> {
    pub fn new(planner: QueryPlanner, executor: QueryExecutor<'a, V>) -> Self {
        Self { planner, executor }
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn run(
        &self,
        groups: &BTreeMap<String, EntryGroupRef>,
        manager: &mut AttemptManager,
    ) -> Result<(), TaxoError> {
        let initial = self.seed(groups, manager);
        if !initial.is_empty() {
            self.execute_round(&initial, manager)?;
        }

        // Escalation is bounded by the rank x authority search space; the
        // guard only catches a classification case that forgot to advance.
        let max_rounds =
            Rank::QUERY_PRECEDENCE.len() * self.planner.authorities().len() + 2;
        let mut round = 0usize;
        loop {
            let processing = heads_with_status(groups, manager, ResolutionStatus::Processing);
            if processing.is_empty() {
                break;
            }
            self.classify_round(&processing, groups, manager);

            let pending = self.collect_retries(groups, manager);
            if pending.is_empty() {
                break;
            }

            round += 1;
            if round > max_rounds {
                warn!(round, "round limit reached before fixpoint");
                break;
            }
            info!(round, queries = pending.len(), "executing retry round");
            self.execute_round(&pending, manager)?;
        }

        self.mark_exhausted(groups, manager);
        Ok(())
    }

    /// Initial queries for fresh groups; empty groups are short-circuited to
    /// a terminal failure without issuing any query. Resumed groups with a
    /// scheduled retry re-enter the loop where they left off.
    fn seed(
        &self,
        groups: &BTreeMap<String, EntryGroupRef>,
        manager: &mut AttemptManager,
    ) -> BTreeMap<String, QueryParameters> {
        enum SeedAction {
            Skip,
            Pending(QueryParameters),
            Fresh,
        }

        let mut initial = BTreeMap::new();
        for (key, group) in groups {
            let action = match manager.latest(key) {
                Some(head) if head.status.is_terminal() => SeedAction::Skip,
                Some(head) if head.status == ResolutionStatus::RetryScheduled => {
                    match &head.scheduled_query {
                        Some(query) => SeedAction::Pending(query.clone()),
                        None => {
                            warn!(group = %key, "retry head without scheduled query");
                            SeedAction::Skip
                        }
                    }
                }
                // A processing head resumes via classification.
                Some(_) => SeedAction::Skip,
                None => SeedAction::Fresh,
            };

            match action {
                SeedAction::Skip => continue,
                SeedAction::Pending(query) => {
                    initial.insert(key.clone(), query);
                }
                SeedAction::Fresh => {
                    if group.is_empty() {
                        let mut new = NewAttempt::bare(
                            key.clone(),
                            QueryParameters {
                                term: String::new(),
                                rank: Rank::Kingdom,
                                source_id: self.planner.primary_authority(),
                            },
                            ResolutionStatus::EmptyInputTaxonomy,
                        );
                        new.failure_reason =
                            Some("entry group has no taxonomic data".to_string());
                        manager.record(new);
                    } else if let Some(query) = self.planner.plan_initial(group) {
                        initial.insert(key.clone(), query);
                    }
                }
            }
        }
        initial
    }

    fn execute_round(
        &self,
        pending: &BTreeMap<String, QueryParameters>,
        manager: &mut AttemptManager,
    ) -> Result<(), TaxoError> {
        let outcomes = self.executor.execute(pending)?;
        for (group_key, query) in pending {
            let mut new = NewAttempt::bare(
                group_key.clone(),
                query.clone(),
                ResolutionStatus::Processing,
            );
            match outcomes.get(group_key) {
                Some(QueryOutcome::Response(name)) => new.response = Some(name.clone()),
                Some(QueryOutcome::Error(message)) => new.error = Some(message.clone()),
                None => new.error = Some("no outcome produced for query".to_string()),
            }
            manager.record(new);
        }
        Ok(())
    }

    /// Classification is embarrassingly parallel: each decision depends only
    /// on the group's own chain and data. Decisions are computed in parallel
    /// and applied sequentially to the append-only store, one new attempt
    /// per group per round.
    fn classify_round(
        &self,
        processing: &[String],
        groups: &BTreeMap<String, EntryGroupRef>,
        manager: &mut AttemptManager,
    ) {
        let decisions: Vec<(String, &'static str, CaseOutcome)> = {
            let snapshot: &AttemptManager = manager;
            processing
                .par_iter()
                .filter_map(|key| {
                    let attempt = snapshot.latest(key)?;
                    let group = groups.get(key)?;
                    let chain = snapshot.chain(key);
                    let ctx = CaseContext {
                        attempt,
                        group,
                        chain: &chain,
                        planner: &self.planner,
                    };
                    let (name, outcome) = classify(&ctx);
                    Some((key.clone(), name, outcome))
                })
                .collect()
        };

        for (group_key, case_name, outcome) in decisions {
            let Some((query, response)) = manager
                .latest(&group_key)
                .map(|head| (head.query.clone(), head.response.clone()))
            else {
                continue;
            };
            let mut new = NewAttempt::bare(group_key, query, outcome.status);
            new.response = response;
            new.resolved_classification = outcome.resolved_classification;
            new.failure_reason = outcome.failure_reason;
            new.case_name = Some(case_name.to_string());
            new.scheduled_query = outcome.scheduled_query;
            new.metadata = outcome.metadata;
            manager.record(new);
        }
    }

    fn collect_retries(
        &self,
        groups: &BTreeMap<String, EntryGroupRef>,
        manager: &AttemptManager,
    ) -> BTreeMap<String, QueryParameters> {
        let mut pending = BTreeMap::new();
        for key in heads_with_status(groups, manager, ResolutionStatus::RetryScheduled) {
            let Some(head) = manager.latest(&key) else {
                continue;
            };
            match &head.scheduled_query {
                Some(query) => {
                    pending.insert(key, query.clone());
                }
                None => warn!(group = %key, "retry head without scheduled query"),
            }
        }
        pending
    }

    /// Any group still non-terminal when no retries remain gets an explicit
    /// exhaustion failure so nothing is silently dropped.
    fn mark_exhausted(
        &self,
        groups: &BTreeMap<String, EntryGroupRef>,
        manager: &mut AttemptManager,
    ) {
        let stuck: Vec<String> = groups
            .keys()
            .filter(|key| {
                manager
                    .latest(key)
                    .map(|head| !head.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for group_key in stuck {
            let Some(query) = manager.latest(&group_key).map(|head| head.query.clone()) else {
                continue;
            };
            let mut new =
                NewAttempt::bare(group_key, query, ResolutionStatus::RetriesExhausted);
            new.failure_reason = Some("resolution ended before a terminal status".to_string());
            manager.record(new);
        }
    }
}

fn heads_with_status(
    groups: &BTreeMap<String, EntryGroupRef>,
    manager: &AttemptManager,
    status: ResolutionStatus,
) -> Vec<String> {
    groups
        .keys()
        .filter(|key| {
            manager
                .latest(key)
                .map(|head| head.status == status)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}
