use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TaxoError;
use crate::fs_util::write_bytes_atomic;

/// Manifest filenames are command-scoped so concurrent commands sharing an
/// output directory never collide on cleanup.
pub fn manifest_filename(command: &str) -> String {
    format!("taxoresolve_{command}_manifest.json")
}

/// Pre-write record of every file a run intends to produce. Written before
/// any output file, so an interrupted run still leaves a complete record of
/// what a later `--full-rerun` may remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub taxoresolve_version: String,
    pub command: String,
    pub created_at: String,
    pub input: String,
    pub cache_namespace: Option<String>,
    /// Relative to the output directory.
    pub files: Vec<String>,
}

pub fn write_manifest(
    output_dir: &Utf8Path,
    command: &str,
    input: &str,
    cache_namespace: Option<&str>,
    files: Vec<String>,
) -> Result<Utf8PathBuf, TaxoError> {
    let manifest = Manifest {
        taxoresolve_version: env!("CARGO_PKG_VERSION").to_string(),
        command: command.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        input: input.to_string(),
        cache_namespace: cache_namespace.map(str::to_string),
        files,
    };
    let path = output_dir.join(manifest_filename(command));
    let content = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    write_bytes_atomic(&path, &content)?;
    info!(manifest = %path, "manifest written");
    Ok(path)
}

pub fn read_manifest(output_dir: &Utf8Path, command: &str) -> Option<Manifest> {
    let path = output_dir.join(manifest_filename(command));
    let content = fs::read_to_string(path.as_std_path()).ok()?;
    serde_json::from_str(&content).ok()
}

/// Delete exactly the files named in an existing manifest, then the manifest
/// itself. Files the manifest does not name are never touched; files already
/// missing are skipped so interrupted runs clean up without error. Returns
/// false (after a warning) when no manifest exists, deleting nothing.
pub fn delete_from_manifest(output_dir: &Utf8Path, command: &str) -> Result<bool, TaxoError> {
    let Some(manifest) = read_manifest(output_dir, command) else {
        warn!(
            command,
            output_dir = %output_dir,
            "no manifest found; skipping output cleanup"
        );
        return Ok(false);
    };

    let mut removed = 0usize;
    for relative in &manifest.files {
        let path = output_dir.join(relative);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
            removed += 1;
        }
    }
    let manifest_path = output_dir.join(manifest_filename(command));
    if manifest_path.as_std_path().exists() {
        fs::remove_file(manifest_path.as_std_path())
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    }
    info!(removed, command, "removed files listed in manifest");
    Ok(true)
}
