use std::collections::BTreeMap;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::app::{CacheClearResult, ResolveResult};
use crate::cache::CacheStats;
use crate::domain::{
    Rank, ResolutionAttempt, ResolutionStatus, StatusCategory, TaxonomicEntry,
};
use crate::error::TaxoError;
use crate::fs_util::write_bytes_atomic;

pub const RESOLVED_FILENAME: &str = "resolved.jsonl";
pub const UNSOLVED_FILENAME: &str = "unsolved.jsonl";
pub const STATS_FILENAME: &str = "resolution_stats.json";

/// One output record: the entry's identity plus its final classification.
/// Resolved ranks override the raw input; anything unresolved keeps the
/// original value so no data is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct OutputRow {
    pub uuid: String,
    pub scientific_name: String,
    pub common_name: String,
    pub source_dataset: String,
    pub source_id: String,
    pub resolution_status: String,
    pub resolution_path: String,
    pub kingdom: String,
    pub phylum: String,
    pub class: String,
    pub order: String,
    pub family: String,
    pub genus: String,
    pub species: String,
}

pub fn entry_row(entry: &TaxonomicEntry, attempt: Option<&ResolutionAttempt>) -> OutputRow {
    let status = attempt
        .map(|a| a.status)
        .unwrap_or(ResolutionStatus::RetriesExhausted);
    let resolved = attempt.and_then(|a| a.resolved_classification.as_ref());

    let rank_value = |rank: Rank| -> String {
        resolved
            .and_then(|classification| classification.get(&rank).cloned())
            .or_else(|| entry.taxonomy.rank(rank).map(str::to_string))
            .unwrap_or_default()
    };

    let resolution_path = match status {
        ResolutionStatus::ForceAccepted => "FORCED",
        _ if status.category() == StatusCategory::Success => "RESOLVED",
        _ => "UNSOLVED",
    };

    OutputRow {
        uuid: entry.uuid.clone(),
        scientific_name: entry.scientific_name.clone().unwrap_or_default(),
        common_name: entry.common_name.clone().unwrap_or_default(),
        source_dataset: entry.source_dataset.clone().unwrap_or_default(),
        source_id: entry.source_id.clone().unwrap_or_default(),
        resolution_status: status.to_string(),
        resolution_path: resolution_path.to_string(),
        kingdom: rank_value(Rank::Kingdom),
        phylum: rank_value(Rank::Phylum),
        class: rank_value(Rank::Class),
        order: rank_value(Rank::Order),
        family: rank_value(Rank::Family),
        genus: rank_value(Rank::Genus),
        species: rank_value(Rank::Species),
    }
}

/// Forced-acceptance row: the input taxonomy is taken as-is, but an entry
/// that fails the seven-rank completeness check is still routed to the
/// unsolved stream with its own failure status.
pub fn forced_row(entry: &TaxonomicEntry, complete: bool) -> OutputRow {
    let status = if complete {
        ResolutionStatus::ForceAccepted
    } else {
        ResolutionStatus::ForcedIncomplete
    };
    let rank_value =
        |rank: Rank| -> String { entry.taxonomy.rank(rank).map(str::to_string).unwrap_or_default() };

    OutputRow {
        uuid: entry.uuid.clone(),
        scientific_name: entry.scientific_name.clone().unwrap_or_default(),
        common_name: entry.common_name.clone().unwrap_or_default(),
        source_dataset: entry.source_dataset.clone().unwrap_or_default(),
        source_id: entry.source_id.clone().unwrap_or_default(),
        resolution_status: status.to_string(),
        resolution_path: if complete { "FORCED" } else { "UNSOLVED" }.to_string(),
        kingdom: rank_value(Rank::Kingdom),
        phylum: rank_value(Rank::Phylum),
        class: rank_value(Rank::Class),
        order: rank_value(Rank::Order),
        family: rank_value(Rank::Family),
        genus: rank_value(Rank::Genus),
        species: rank_value(Rank::Species),
    }
}

/// Write one JSONL stream atomically.
pub fn write_stream(path: &Utf8Path, rows: &[OutputRow]) -> Result<(), TaxoError> {
    let mut buffer = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buffer, row)
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        buffer.push(b'\n');
    }
    write_bytes_atomic(path, &buffer)?;
    info!(rows = rows.len(), path = %path, "wrote output stream");
    Ok(())
}

/// Machine-readable per-status counts for operator review.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionStatsFile {
    pub total_entries: usize,
    pub resolved_entries: usize,
    pub unsolved_entries: usize,
    pub entry_groups: usize,
    pub status_counts: BTreeMap<String, usize>,
}

pub fn write_stats(
    output_dir: &Utf8Path,
    stats: &ResolutionStatsFile,
) -> Result<Utf8PathBuf, TaxoError> {
    let path = output_dir.join(STATS_FILENAME);
    let content = serde_json::to_vec_pretty(stats)
        .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    write_bytes_atomic(&path, &content)?;
    Ok(path)
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_resolve(result: &ResolveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cache_stats(stats: &CacheStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    pub fn print_cache_clear(result: &CacheClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|err| io::Error::other(err))?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{QueryParameters, Taxonomy};

    fn entry() -> TaxonomicEntry {
        TaxonomicEntry {
            uuid: "u1".to_string(),
            taxonomy: Taxonomy {
                kingdom: Some("Animalia".to_string()),
                species: Some("Puma concolor".to_string()),
                ..Taxonomy::default()
            },
            scientific_name: Some("Puma concolor".to_string()),
            common_name: Some("cougar".to_string()),
            source_dataset: Some("tol".to_string()),
            source_id: None,
        }
    }

    fn attempt(status: ResolutionStatus) -> ResolutionAttempt {
        ResolutionAttempt {
            id: "a1".to_string(),
            group_key: "g1".to_string(),
            query: QueryParameters {
                term: "Puma concolor".to_string(),
                rank: Rank::Species,
                source_id: 11,
            },
            status,
            response: None,
            resolved_classification: None,
            error: None,
            failure_reason: None,
            case_name: None,
            previous_attempt_id: None,
            scheduled_query: None,
            metadata: BTreeMap::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn resolved_classification_overrides_input_ranks() {
        let mut success = attempt(ResolutionStatus::ExactMatch);
        let mut classification = BTreeMap::new();
        classification.insert(Rank::Kingdom, "Animalia".to_string());
        classification.insert(Rank::Genus, "Puma".to_string());
        classification.insert(Rank::Species, "Puma concolor".to_string());
        success.resolved_classification = Some(classification);

        let row = entry_row(&entry(), Some(&success));
        assert_eq!(row.resolution_status, "EXACT_MATCH");
        assert_eq!(row.resolution_path, "RESOLVED");
        assert_eq!(row.genus, "Puma");
        // Unresolved ranks keep the original input value.
        assert_eq!(row.phylum, "");
    }

    #[test]
    fn failed_entry_keeps_input_and_is_unsolved() {
        let failure = attempt(ResolutionStatus::AmbiguousTie);
        let row = entry_row(&entry(), Some(&failure));
        assert_eq!(row.resolution_path, "UNSOLVED");
        assert_eq!(row.species, "Puma concolor");
    }

    #[test]
    fn streams_are_written_as_jsonl() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let rows = vec![entry_row(&entry(), Some(&attempt(ResolutionStatus::ExactMatch)))];
        let path = dir.join(RESOLVED_FILENAME);
        write_stream(&path, &rows).unwrap();

        let content = std::fs::read_to_string(path.as_std_path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["uuid"], "u1");
    }
}
