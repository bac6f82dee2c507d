use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::cache::{CacheContext, CacheStats};
use crate::config::ResolverConfig;
use crate::domain::{EntryGroupRef, Rank, StatusCategory, TaxonomicEntry};
use crate::error::TaxoError;
use crate::executor::QueryExecutor;
use crate::grouper::{group_entries, group_key};
use crate::input::{
    compute_checksum, compute_file_metadata_hash, find_input_files, read_entries,
};
use crate::manager::{AttemptManager, ResolutionEngine};
use crate::manifest::{delete_from_manifest, manifest_filename, write_manifest};
use crate::output::{
    entry_row, forced_row, write_stats, write_stream, OutputRow, ResolutionStatsFile,
    RESOLVED_FILENAME, STATS_FILENAME, UNSOLVED_FILENAME,
};
use crate::planner::QueryPlanner;
use crate::verifier::VerifierClient;

const ENTRIES_CACHE_KEY: &str = "taxonomic_entries";
const GROUPS_CACHE_KEY: &str = "entry_groups";
const ATTEMPTS_CACHE_KEY: &str = "resolution_attempts";

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub input: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub full_rerun: bool,
    pub force_input: bool,
    pub no_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveResult {
    pub command: String,
    pub total_entries: usize,
    pub entry_groups: usize,
    pub resolved_entries: usize,
    pub unsolved_entries: usize,
    pub attempts: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub output_files: Vec<String>,
    pub cache_namespace: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheClearResult {
    pub cleared: usize,
    pub all_namespaces: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<V: VerifierClient> {
    config: ResolverConfig,
    verifier: V,
}

impl<V: VerifierClient> App<V> {
    pub fn new(config: ResolverConfig, verifier: V) -> Self {
        Self { config, verifier }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn resolve(
        &self,
        options: &ResolveOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ResolveResult, TaxoError> {
        let command = command_name(options.force_input);

        sink.event(ProgressEvent {
            message: format!("phase=Discover; scanning {}", options.input),
            elapsed: None,
        });
        let files = find_input_files(&options.input)?;
        let fingerprint = compute_file_metadata_hash(&files)?;
        let checksum = compute_checksum(&files)?;

        let cache = CacheContext::for_command(
            &self.config.cache_base_dir,
            command,
            env!("CARGO_PKG_VERSION"),
            &fingerprint,
            self.config.cache_max_age_secs,
        )?;

        if options.full_rerun {
            sink.event(ProgressEvent {
                message: "phase=Cleanup; full rerun requested".to_string(),
                elapsed: None,
            });
            let cleared = cache.clear()?;
            info!(cleared, "cleared cache namespace for full rerun");
            delete_from_manifest(&options.output_dir, command)?;
        }

        sink.event(ProgressEvent {
            message: "phase=Parse; reading entries".to_string(),
            elapsed: None,
        });
        let entries = self.load_entries(&cache, &files, &checksum, options.no_cache)?;

        sink.event(ProgressEvent {
            message: "phase=Group; fingerprinting entries".to_string(),
            elapsed: None,
        });
        let groups = self.load_groups(&cache, &entries, &checksum, options.no_cache)?;

        // The manifest names every intended output before any is written.
        let intended = vec![
            RESOLVED_FILENAME.to_string(),
            UNSOLVED_FILENAME.to_string(),
            STATS_FILENAME.to_string(),
            manifest_filename(command),
        ];
        write_manifest(
            &options.output_dir,
            command,
            options.input.as_str(),
            Some(cache.namespace().as_str()),
            intended,
        )?;

        let result = if options.force_input {
            self.run_forced(options, &cache, &entries, &groups, sink)?
        } else {
            self.run_resolution(options, &cache, &checksum, &entries, &groups, sink)?
        };

        Ok(result)
    }

    fn run_resolution(
        &self,
        options: &ResolveOptions,
        cache: &CacheContext,
        checksum: &str,
        entries: &[TaxonomicEntry],
        groups: &BTreeMap<String, EntryGroupRef>,
        sink: &dyn ProgressSink,
    ) -> Result<ResolveResult, TaxoError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} groups", groups.len()),
            elapsed: None,
        });

        let planner = QueryPlanner::new(
            self.config
                .authorities
                .iter()
                .map(|authority| authority.id)
                .collect(),
        )?;
        let executor = QueryExecutor::new(
            &self.verifier,
            self.config.verifier.clone(),
            self.config.batch_size,
            self.config.parallelism,
        );
        let engine = ResolutionEngine::new(planner, executor);

        let mut manager = if options.no_cache {
            AttemptManager::new()
        } else {
            match cache.load(ATTEMPTS_CACHE_KEY, checksum) {
                Some(attempts) => AttemptManager::from_attempts(attempts),
                None => AttemptManager::new(),
            }
        };

        let start = std::time::Instant::now();
        engine.run(groups, &mut manager)?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} attempts", manager.attempt_count()),
            elapsed: Some(start.elapsed()),
        });

        if !options.no_cache {
            cache.save(ATTEMPTS_CACHE_KEY, checksum, &manager.snapshot())?;
        }

        sink.event(ProgressEvent {
            message: "phase=Write; writing output streams".to_string(),
            elapsed: None,
        });
        let mut resolved_rows = Vec::new();
        let mut unsolved_rows = Vec::new();
        for entry in entries {
            let key = group_key(&entry.taxonomy, entry.scientific_name.as_deref());
            let attempt = manager.latest(&key);
            let row = entry_row(entry, attempt);
            let success = attempt
                .map(|a| a.status.category() == StatusCategory::Success)
                .unwrap_or(false);
            if success {
                resolved_rows.push(row);
            } else {
                unsolved_rows.push(row);
            }
        }

        let status_counts: BTreeMap<String, usize> = manager
            .status_counts()
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        self.write_outputs(
            options,
            command_name(false),
            cache,
            entries.len(),
            groups.len(),
            manager.attempt_count(),
            resolved_rows,
            unsolved_rows,
            status_counts,
        )
    }

    fn run_forced(
        &self,
        options: &ResolveOptions,
        cache: &CacheContext,
        entries: &[TaxonomicEntry],
        groups: &BTreeMap<String, EntryGroupRef>,
        sink: &dyn ProgressSink,
    ) -> Result<ResolveResult, TaxoError> {
        sink.event(ProgressEvent {
            message: "phase=Write; forced acceptance, bypassing resolution".to_string(),
            elapsed: None,
        });

        let mut resolved_rows = Vec::new();
        let mut unsolved_rows = Vec::new();
        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in entries {
            let complete = Rank::CLASSIFICATION
                .iter()
                .all(|rank| entry.taxonomy.populated(*rank).is_some());
            let row = forced_row(entry, complete);
            *status_counts
                .entry(row.resolution_status.clone())
                .or_insert(0) += 1;
            if complete {
                resolved_rows.push(row);
            } else {
                unsolved_rows.push(row);
            }
        }

        self.write_outputs(
            options,
            command_name(true),
            cache,
            entries.len(),
            groups.len(),
            0,
            resolved_rows,
            unsolved_rows,
            status_counts,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn write_outputs(
        &self,
        options: &ResolveOptions,
        command: &str,
        cache: &CacheContext,
        total_entries: usize,
        entry_groups: usize,
        attempts: usize,
        resolved_rows: Vec<OutputRow>,
        unsolved_rows: Vec<OutputRow>,
        status_counts: BTreeMap<String, usize>,
    ) -> Result<ResolveResult, TaxoError> {
        let resolved_path = options.output_dir.join(RESOLVED_FILENAME);
        let unsolved_path = options.output_dir.join(UNSOLVED_FILENAME);
        write_stream(&resolved_path, &resolved_rows)?;
        write_stream(&unsolved_path, &unsolved_rows)?;

        let stats = ResolutionStatsFile {
            total_entries,
            resolved_entries: resolved_rows.len(),
            unsolved_entries: unsolved_rows.len(),
            entry_groups,
            status_counts: status_counts.clone(),
        };
        let stats_path = write_stats(&options.output_dir, &stats)?;

        Ok(ResolveResult {
            command: command.to_string(),
            total_entries,
            entry_groups,
            resolved_entries: resolved_rows.len(),
            unsolved_entries: unsolved_rows.len(),
            attempts,
            status_counts,
            output_files: vec![
                resolved_path.to_string(),
                unsolved_path.to_string(),
                stats_path.to_string(),
            ],
            cache_namespace: cache.namespace().to_string(),
        })
    }

    fn load_entries(
        &self,
        cache: &CacheContext,
        files: &[Utf8PathBuf],
        checksum: &str,
        no_cache: bool,
    ) -> Result<Vec<TaxonomicEntry>, TaxoError> {
        if !no_cache {
            if let Some(entries) = cache.load::<Vec<TaxonomicEntry>>(ENTRIES_CACHE_KEY, checksum) {
                return Ok(entries);
            }
        }
        let entries = read_entries(files)?;
        if !no_cache {
            cache.save(ENTRIES_CACHE_KEY, checksum, &entries)?;
        }
        Ok(entries)
    }

    fn load_groups(
        &self,
        cache: &CacheContext,
        entries: &[TaxonomicEntry],
        checksum: &str,
        no_cache: bool,
    ) -> Result<BTreeMap<String, EntryGroupRef>, TaxoError> {
        if !no_cache {
            if let Some(groups) =
                cache.load::<BTreeMap<String, EntryGroupRef>>(GROUPS_CACHE_KEY, checksum)
            {
                return Ok(groups);
            }
        }
        let groups = group_entries(entries);
        if !no_cache {
            cache.save(GROUPS_CACHE_KEY, checksum, &groups)?;
        }
        Ok(groups)
    }

    /// Read-only cache diagnostics for the namespace a resolve over this
    /// input would use.
    pub fn cache_stats(&self, input: &Utf8Path, force_input: bool) -> Result<CacheStats, TaxoError> {
        let files = find_input_files(input)?;
        let fingerprint = compute_file_metadata_hash(&files)?;
        let cache = CacheContext::for_command(
            &self.config.cache_base_dir,
            command_name(force_input),
            env!("CARGO_PKG_VERSION"),
            &fingerprint,
            self.config.cache_max_age_secs,
        )?;
        Ok(cache.stats())
    }

    pub fn cache_clear(
        &self,
        input: Option<&Utf8Path>,
        all: bool,
    ) -> Result<CacheClearResult, TaxoError> {
        if all {
            let cleared = CacheContext::clear_all(&self.config.cache_base_dir)?;
            return Ok(CacheClearResult {
                cleared,
                all_namespaces: true,
            });
        }
        let Some(input) = input else {
            return Err(TaxoError::NoInputFiles(
                "cache clear requires --input or --all".to_string(),
            ));
        };
        let files = find_input_files(input)?;
        let fingerprint = compute_file_metadata_hash(&files)?;
        let cache = CacheContext::for_command(
            &self.config.cache_base_dir,
            command_name(false),
            env!("CARGO_PKG_VERSION"),
            &fingerprint,
            self.config.cache_max_age_secs,
        )?;
        let cleared = cache.clear()?;
        Ok(CacheClearResult {
            cleared,
            all_namespaces: false,
        })
    }
}

fn command_name(force_input: bool) -> &'static str {
    if force_input {
        "force-input"
    } else {
        "resolve"
    }
}
