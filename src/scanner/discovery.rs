use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

/// Recursively list image files under `directory`, sorted by path.
///
/// Extensions match case-insensitively, with or without a leading dot.
/// Entries that cannot be read are logged and skipped.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        bail!("{} is not a directory", directory.display());
    }

    let wanted: HashSet<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();
    let started = Instant::now();
    let mut images = Vec::new();
    let mut unreadable = 0usize;

    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable directory entry");
                unreadable += 1;
                continue;
            }
        };
        if entry.file_type().is_file() && matches_extension(entry.path(), &wanted) {
            images.push(entry.into_path());
        }
    }

    images.sort();
    tracing::info!(
        directory = %directory.display(),
        files = images.len(),
        unreadable,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Directory walk complete"
    );
    Ok(images)
}

fn matches_extension(path: &Path, wanted: &HashSet<String>) -> bool {
    path.extension()
        .map(|ext| wanted.contains(&ext.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_walks_nested_dirs_in_path_order() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("2019")).unwrap();
        File::create(dir.path().join("2019/b.JPG")).unwrap();
        File::create(dir.path().join("a.png")).unwrap();
        File::create(dir.path().join("c.webp")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        File::create(dir.path().join("README")).unwrap();

        // Dotted and bare extensions are both accepted
        let extensions = vec![".jpg".to_string(), "PNG".to_string()];
        let images = discover_images(dir.path(), &extensions).unwrap();

        let names: Vec<_> = images
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["2019/b.JPG", "a.png"]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(discover_images(&dir.path().join("gone"), &["jpg".to_string()]).is_err());
    }
}
