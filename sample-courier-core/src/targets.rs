use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::identity::ObjectKey;

/// What a batch job works on: a file on disk or a key the remote side knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local(PathBuf),
    Remote(ObjectKey),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local(path) => write!(f, "{}", path.display()),
            Target::Remote(key) => write!(f, "{key}"),
        }
    }
}

impl From<ObjectKey> for Target {
    fn from(key: ObjectKey) -> Self {
        Target::Remote(key)
    }
}

impl From<PathBuf> for Target {
    fn from(path: PathBuf) -> Self {
        Target::Local(path)
    }
}

/// Regular files under `root` (or `root` itself when it is a file), in a
/// stable walk order. Symlinks are not followed.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::InvalidInput(format!(
            "{} does not exist",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            tracing::error!(error = %e, root = %root.display(), "Directory walk failed");
            Error::InvalidInput(e.to_string())
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    tracing::info!(root = %root.display(), files = files.len(), "Collected files to process");
    Ok(files)
}

/// Local targets for every file under `root`.
pub fn local_targets(root: &Path) -> Result<Vec<Target>> {
    Ok(walk_files(root)?.into_iter().map(Target::Local).collect())
}

pub fn remote_targets(keys: impl IntoIterator<Item = ObjectKey>) -> Vec<Target> {
    keys.into_iter().map(Target::Remote).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn walks_nested_directories_in_name_order() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.bin"), b"b").unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::write(dir.path().join("sub").join("c.bin"), b"c").unwrap();

        let files = walk_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.bin"),
                PathBuf::from("b.bin"),
                PathBuf::from("sub").join("c.bin"),
            ]
        );
    }

    #[test]
    fn a_single_file_is_its_own_batch() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("only.bin");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(walk_files(&file).unwrap(), vec![file]);
    }

    #[test]
    fn missing_paths_are_invalid_input() {
        let err = walk_files(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
