use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;

use crate::error::TaxoError;

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), TaxoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| TaxoError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, TaxoError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| TaxoError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| TaxoError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let temp = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(temp.path().join("nested/dir/file.json")).unwrap();
        write_bytes_atomic(&path, b"first").unwrap();
        write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"second");
    }
}
