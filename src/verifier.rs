use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::Rank;
use crate::error::TaxoError;

/// Kingdom labels that differ across authorities but denote the same taxon.
const KINGDOM_SYNONYMS: &[(&str, &str)] = &[("Metazoa", "Animalia")];

/// Global options forwarded with every verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierOptions {
    pub all_matches: bool,
    pub capitalize: bool,
    pub species_group: bool,
    pub fuzzy_uninomial: bool,
    pub fuzzy_relaxed: bool,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            all_matches: true,
            capitalize: true,
            species_group: false,
            fuzzy_uninomial: false,
            fuzzy_relaxed: false,
        }
    }
}

/// One item of a batched verification request. The executor guarantees all
/// requests in a batch share the same `source_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierRequest {
    pub term: String,
    pub rank: Rank,
    pub source_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    Exact,
    ExactSpeciesGroup,
    Fuzzy,
    FuzzyRelaxed,
    FuzzySpeciesGroup,
    PartialExact,
    PartialFuzzy,
    PartialFuzzyRelaxed,
    Virus,
    FacetedSearch,
    NoMatch,
}

/// One candidate match returned by the verifier for a queried term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierMatch {
    pub data_source_id: u32,
    pub match_type: MatchType,
    #[serde(default)]
    pub matched_name: Option<String>,
    #[serde(default)]
    pub current_name: Option<String>,
    #[serde(default)]
    pub taxonomic_status: Option<String>,
    #[serde(default)]
    pub classification_path: Option<String>,
    #[serde(default)]
    pub classification_ranks: Option<String>,
}

impl VerifierMatch {
    pub fn is_accepted(&self) -> bool {
        self.taxonomic_status.as_deref() == Some("Accepted")
    }
}

/// The verifier's per-term response: overall match type plus candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedName {
    pub name: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub results: Vec<VerifierMatch>,
    #[serde(default)]
    pub error: Option<String>,
}

impl VerifiedName {
    pub fn is_no_match(&self) -> bool {
        self.match_type == MatchType::NoMatch || self.results.is_empty()
    }
}

/// Map a candidate's pipe-separated classification path onto the seven
/// standard ranks. Unknown intermediate ranks are skipped; kingdom labels are
/// canonicalized through the synonym table.
pub fn extract_classification(candidate: &VerifierMatch) -> BTreeMap<Rank, String> {
    let mut classification = BTreeMap::new();
    let (Some(path), Some(ranks)) = (
        candidate.classification_path.as_deref(),
        candidate.classification_ranks.as_deref(),
    ) else {
        return classification;
    };

    for (rank, name) in ranks.split('|').zip(path.split('|')) {
        let Ok(rank) = rank.parse::<Rank>() else {
            continue;
        };
        if rank == Rank::ScientificName {
            continue;
        }
        let name = if rank == Rank::Kingdom {
            canonical_kingdom(name)
        } else {
            name
        };
        classification.insert(rank, name.trim().to_string());
    }
    classification
}

pub fn canonical_kingdom(name: &str) -> &str {
    KINGDOM_SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == name.trim())
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

pub trait VerifierClient: Send + Sync {
    /// Verify a batch of terms against a single authority. The i-th response
    /// corresponds to the i-th request; a short response is surfaced by the
    /// executor as per-item errors, never padded silently.
    fn verify_batch(
        &self,
        requests: &[VerifierRequest],
        options: &VerifierOptions,
    ) -> Result<Vec<VerifiedName>, TaxoError>;
}

#[derive(Clone)]
pub struct GnVerifierHttpClient {
    client: Client,
    base_url: String,
}

impl GnVerifierHttpClient {
    pub fn new() -> Result<Self, TaxoError> {
        Self::with_base_url("https://verifier.globalnames.org/api/v1".to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, TaxoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("taxoresolve/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TaxoError::VerifierHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| TaxoError::VerifierHttp(err.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, TaxoError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(TaxoError::VerifierHttp(err.to_string()));
                }
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationRequest<'a> {
    name_strings: Vec<&'a str>,
    data_sources: Vec<u32>,
    with_all_matches: bool,
    with_capitalization: bool,
    with_species_group: bool,
    with_uninomial_fuzzy_match: bool,
    with_relaxed_fuzzy_match: bool,
}

#[derive(Deserialize)]
struct VerificationOutput {
    #[serde(default)]
    names: Vec<VerifiedName>,
}

impl VerifierClient for GnVerifierHttpClient {
    fn verify_batch(
        &self,
        requests: &[VerifierRequest],
        options: &VerifierOptions,
    ) -> Result<Vec<VerifiedName>, TaxoError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let source_id = requests[0].source_id;
        let body = VerificationRequest {
            name_strings: requests.iter().map(|req| req.term.as_str()).collect(),
            data_sources: vec![source_id],
            with_all_matches: options.all_matches,
            with_capitalization: options.capitalize,
            with_species_group: options.species_group,
            with_uninomial_fuzzy_match: options.fuzzy_uninomial,
            with_relaxed_fuzzy_match: options.fuzzy_relaxed,
        };

        let url = format!("{}/verifications", self.base_url);
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "verifier request failed".to_string());
            return Err(TaxoError::VerifierStatus { status, message });
        }

        let output: VerificationOutput = response
            .json()
            .map_err(|err| TaxoError::VerifierHttp(err.to_string()))?;
        Ok(output.names)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
