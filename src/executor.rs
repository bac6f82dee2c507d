use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::domain::{QueryParameters, Rank};
use crate::error::TaxoError;
use crate::verifier::{VerifiedName, VerifierClient, VerifierOptions, VerifierRequest};

/// Per-group result of one executor invocation. A collaborator-level failure
/// is an attempt-level error for the groups that asked, never a run abort,
/// and is distinct from a well-formed "zero candidates" response.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Response(VerifiedName),
    Error(String),
}

/// Deduplicates and batches query requests across groups, calls the external
/// verifier, and fans responses back out per group.
pub struct QueryExecutor<'a, V: VerifierClient> {
    client: &'a V,
    options: VerifierOptions,
    batch_size: usize,
    parallelism: usize,
}

type QueryTuple = (u32, Rank, String);

impl<'a, V: VerifierClient> QueryExecutor<'a, V> {
    pub fn new(
        client: &'a V,
        options: VerifierOptions,
        batch_size: usize,
        parallelism: usize,
    ) -> Self {
        Self {
            client,
            options,
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Execute one round of requests. Two groups asking the identical
    /// (term, rank, authority) tuple are coalesced into a single outbound
    /// call; never more than one outbound request per distinct tuple.
    pub fn execute(
        &self,
        requests: &BTreeMap<String, QueryParameters>,
    ) -> Result<BTreeMap<String, QueryOutcome>, TaxoError> {
        let mut distinct: BTreeMap<QueryTuple, Vec<String>> = BTreeMap::new();
        for (group_key, query) in requests {
            distinct
                .entry((query.source_id, query.rank, query.term.clone()))
                .or_default()
                .push(group_key.clone());
        }

        let batches = self.build_batches(&distinct);
        debug!(
            groups = requests.len(),
            distinct = distinct.len(),
            batches = batches.len(),
            "executing query round"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .build()
            .map_err(|err| TaxoError::WorkerPool(err.to_string()))?;

        let batch_results: Vec<Vec<(QueryTuple, QueryOutcome)>> =
            pool.install(|| batches.par_iter().map(|batch| self.run_batch(batch)).collect());

        let mut outcomes = BTreeMap::new();
        for (tuple, outcome) in batch_results.into_iter().flatten() {
            let Some(group_keys) = distinct.get(&tuple) else {
                continue;
            };
            for group_key in group_keys {
                outcomes.insert(group_key.clone(), outcome.clone());
            }
        }
        Ok(outcomes)
    }

    /// Batches hold tuples of a single authority: the verifier scopes its
    /// source filter to the whole request.
    fn build_batches(&self, distinct: &BTreeMap<QueryTuple, Vec<String>>) -> Vec<Vec<QueryTuple>> {
        let mut batches = Vec::new();
        let mut current: Vec<QueryTuple> = Vec::new();
        for tuple in distinct.keys() {
            let source_changed = current
                .last()
                .map(|(source_id, _, _)| *source_id != tuple.0)
                .unwrap_or(false);
            if source_changed || current.len() == self.batch_size {
                batches.push(std::mem::take(&mut current));
            }
            current.push(tuple.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    fn run_batch(&self, batch: &[QueryTuple]) -> Vec<(QueryTuple, QueryOutcome)> {
        let requests: Vec<VerifierRequest> = batch
            .iter()
            .map(|(source_id, rank, term)| VerifierRequest {
                term: term.clone(),
                rank: *rank,
                source_id: *source_id,
            })
            .collect();

        match self.client.verify_batch(&requests, &self.options) {
            Ok(names) => batch
                .iter()
                .enumerate()
                .map(|(index, tuple)| {
                    let outcome = match names.get(index) {
                        Some(name) => QueryOutcome::Response(name.clone()),
                        None => QueryOutcome::Error(format!(
                            "verifier returned no response item for term '{}'",
                            tuple.2
                        )),
                    };
                    (tuple.clone(), outcome)
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, terms = batch.len(), "verifier batch failed");
                batch
                    .iter()
                    .map(|tuple| (tuple.clone(), QueryOutcome::Error(err.to_string())))
                    .collect()
            }
        }
    }
}
