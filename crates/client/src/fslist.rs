//! Local directory listing.

use std::io;
use std::path::Path;

use pinnet_types::{Error, Result};

/// List the immediate entries of `dir`, one directory level only.
pub async fn list(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| map_io(dir, err))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| map_io(dir, err))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Entries of `dir` whose names end with `ext`, preserving listing order.
pub async fn list_ext(dir: impl AsRef<Path>, ext: &str) -> Result<Vec<String>> {
    Ok(list(dir)
        .await?
        .into_iter()
        .filter(|name| name.ends_with(ext))
        .collect())
}

fn map_io(dir: &Path, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::DirNotFound(dir.to_path_buf()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(dir.to_path_buf()),
        _ => Error::FileRead {
            path: dir.to_path_buf(),
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["alpha.txt", "beta.log", "gamma.txt", "delta"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("inner.txt"), b"x").unwrap();
        dir
    }

    #[tokio::test]
    async fn list_returns_exactly_the_immediate_entries() {
        let dir = fixture();
        let names: HashSet<String> = list(dir.path()).await.unwrap().into_iter().collect();

        let expected: HashSet<String> = ["alpha.txt", "beta.log", "gamma.txt", "delta", "nested"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn list_ext_is_the_order_preserving_filtered_subsequence() {
        let dir = fixture();
        let all = list(dir.path()).await.unwrap();
        let txt = list_ext(dir.path(), ".txt").await.unwrap();

        let expected: Vec<String> = all
            .iter()
            .filter(|name| name.ends_with(".txt"))
            .cloned()
            .collect();
        assert_eq!(txt, expected);
        assert_eq!(txt.len(), 2);
    }

    #[tokio::test]
    async fn list_ext_with_unmatched_extension_is_empty() {
        let dir = fixture();
        assert!(list_ext(dir.path(), ".rs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_fails_with_dir_not_found() {
        let result = list("/definitely/not/a/real/dir").await;
        assert!(matches!(result, Err(Error::DirNotFound(_))));
    }
}
