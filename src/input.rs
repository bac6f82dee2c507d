use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::TaxonomicEntry;
use crate::error::TaxoError;
use crate::fs_util::walk_dir;

/// Discover input files: a single file is taken as-is, a directory is
/// walked for `.jsonl` files. The list is sorted so fingerprints and cache
/// keys are stable across runs.
pub fn find_input_files(input: &Utf8Path) -> Result<Vec<Utf8PathBuf>, TaxoError> {
    let std_path = input.as_std_path();
    if std_path.is_file() {
        return Ok(vec![input.to_owned()]);
    }
    if !std_path.is_dir() {
        return Err(TaxoError::NoInputFiles(input.to_string()));
    }

    let mut files: Vec<Utf8PathBuf> = walk_dir(std_path)?
        .into_iter()
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext == "jsonl")
                    .unwrap_or(false)
        })
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(TaxoError::NoInputFiles(input.to_string()));
    }
    Ok(files)
}

/// Read entries from JSONL files, one JSON object per line. Blank lines are
/// skipped; a malformed line is an input error carrying its location.
pub fn read_entries(files: &[Utf8PathBuf]) -> Result<Vec<TaxonomicEntry>, TaxoError> {
    let mut entries = Vec::new();
    for file in files {
        let content = fs::read_to_string(file.as_std_path())
            .map_err(|err| TaxoError::Filesystem(format!("read {file}: {err}")))?;
        let source_dataset = file
            .file_stem()
            .map(str::to_string);
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut entry: TaxonomicEntry =
                serde_json::from_str(line).map_err(|err| TaxoError::InputParse {
                    path: file.to_string(),
                    line: index + 1,
                    message: err.to_string(),
                })?;
            if entry.source_dataset.is_none() {
                entry.source_dataset = source_dataset.clone();
            }
            entries.push(entry);
        }
    }
    debug!(entries = entries.len(), files = files.len(), "read input entries");
    Ok(entries)
}

/// Content checksum over the input files, used to validate cache entries.
pub fn compute_checksum(files: &[Utf8PathBuf]) -> Result<String, TaxoError> {
    let mut sorted: Vec<&Utf8PathBuf> = files.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for file in sorted {
        let content = fs::read(file.as_std_path())
            .map_err(|err| TaxoError::Filesystem(format!("read {file}: {err}")))?;
        hasher.update(&content);
    }
    Ok(finish_hex(hasher))
}

/// Cheap input fingerprint over path, size, and mtime, used to derive the
/// cache namespace. Changing any input file lands the run in a fresh
/// namespace.
pub fn compute_file_metadata_hash(files: &[Utf8PathBuf]) -> Result<String, TaxoError> {
    let mut sorted: Vec<&Utf8PathBuf> = files.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for file in sorted {
        let metadata = fs::metadata(file.as_std_path())
            .map_err(|err| TaxoError::Filesystem(format!("stat {file}: {err}")))?;
        let mtime_nanos = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        hasher.update(file.as_str().as_bytes());
        hasher.update(metadata.len().to_string().as_bytes());
        hasher.update(mtime_nanos.to_string().as_bytes());
    }
    Ok(finish_hex(hasher))
}

fn finish_hex(hasher: Sha256) -> String {
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

    fn write_file(dir: &std::path::Path, name: &str, content: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn reads_jsonl_entries_with_sparse_ranks() {
        let temp = tempfile::tempdir().unwrap();
        let file = write_file(
            temp.path(),
            "tol.jsonl",
            concat!(
                r#"{"uuid":"u1","kingdom":"Animalia","species":"Puma concolor"}"#,
                "\n\n",
                r#"{"uuid":"u2","scientific_name":"Lynx lynx","common_name":"Eurasian lynx"}"#,
                "\n",
            ),
        );

        let entries = read_entries(&[file]).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].taxonomy.kingdom.as_deref(), Some("Animalia"));
        assert_eq!(entries[1].scientific_name.as_deref(), Some("Lynx lynx"));
        assert_eq!(entries[0].source_dataset.as_deref(), Some("tol"));
    }

    #[test]
    fn malformed_line_reports_location() {
        let temp = tempfile::tempdir().unwrap();
        let file = write_file(temp.path(), "bad.jsonl", "{\"uuid\":\"u1\"}\nnot json\n");

        let err = read_entries(&[file]).unwrap_err();
        assert_matches!(err, TaxoError::InputParse { line: 2, .. });
    }

    #[test]
    fn directory_discovery_ignores_other_extensions() {
        let temp = tempfile::tempdir().unwrap();
        write_file(temp.path(), "a.jsonl", "{\"uuid\":\"u1\"}\n");
        write_file(temp.path(), "b.jsonl", "{\"uuid\":\"u2\"}\n");
        write_file(temp.path(), "notes.txt", "ignored");

        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let files = find_input_files(&dir).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let err = find_input_files(&dir).unwrap_err();
        assert_matches!(err, TaxoError::NoInputFiles(_));
    }

    #[test]
    fn metadata_fingerprint_changes_with_content_size() {
        let temp = tempfile::tempdir().unwrap();
        let file = write_file(temp.path(), "a.jsonl", "{\"uuid\":\"u1\"}\n");
        let before = compute_file_metadata_hash(std::slice::from_ref(&file)).unwrap();

        fs::write(
            file.as_std_path(),
            "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n",
        )
        .unwrap();
        let after = compute_file_metadata_hash(std::slice::from_ref(&file)).unwrap();
        assert_ne!(before, after);
    }
}
