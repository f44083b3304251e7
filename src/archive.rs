//! Cleanup and packaging of the job's working area into its log file.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::PilotError;

/// Write a gzip-compressed tar of every top-level entry of `dir` into
/// `dir/archive_name`, leaving out `protected` names and the archive itself.
///
/// Returns the archive path and the number of entries packed.
pub async fn pack_logs(
    dir: &Path,
    protected: Vec<String>,
    archive_name: &str,
) -> Result<(PathBuf, usize), PilotError> {
    let dir = dir.to_path_buf();
    let archive_name = archive_name.to_string();
    tokio::task::spawn_blocking(move || pack_blocking(&dir, &protected, &archive_name))
        .await
        .map_err(|e| PilotError::LogFileCreation(format!("archive task failed: {e}")))?
}

/// Delete top-level entries of `dir` whose name matches one of `patterns`
/// (`*` and `?` wildcards). `protected` names are never touched.
///
/// Returns the number of entries removed.
pub async fn remove_redundant_files(
    dir: &Path,
    patterns: Vec<String>,
    protected: Vec<String>,
) -> Result<usize, PilotError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || remove_blocking(&dir, &patterns, &protected))
        .await
        .map_err(|e| PilotError::FileHandling(format!("cleanup task failed: {e}")))?
}

fn remove_blocking(dir: &Path, patterns: &[String], protected: &[String]) -> Result<usize, PilotError> {
    let fail = |e: std::io::Error| PilotError::file_handling("Cleanup of working directory failed", e);
    let mut removed = 0;
    for entry in std::fs::read_dir(dir).map_err(fail)? {
        let entry = entry.map_err(fail)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if protected.contains(&name) || !patterns.iter().any(|p| wildcard_match(p, &name)) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            std::fs::remove_dir_all(&path).map_err(fail)?;
        } else {
            std::fs::remove_file(&path).map_err(fail)?;
        }
        tracing::debug!(path = %path.display(), "removed redundant file");
        removed += 1;
    }
    Ok(removed)
}

/// Shell-style match supporting `*` (any run) and `?` (one char).
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

fn pack_blocking(
    dir: &Path,
    protected: &[String],
    archive_name: &str,
) -> Result<(PathBuf, usize), PilotError> {
    let fail = |e: std::io::Error| PilotError::LogFileCreation(format!("{archive_name}: {e}"));
    let archive_path = dir.join(archive_name);

    let mut names: Vec<_> = std::fs::read_dir(dir)
        .map_err(fail)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(|name| {
            let name = name.to_string_lossy();
            name != archive_name && !protected.iter().any(|p| p.as_str() == name)
        })
        .collect();
    names.sort();

    let file = File::create(&archive_path).map_err(fail)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for name in &names {
        let path = dir.join(name);
        if path.is_dir() && !path.is_symlink() {
            builder.append_dir_all(name, &path).map_err(fail)?;
        } else {
            builder.append_path_with_name(&path, name).map_err(fail)?;
        }
    }
    builder.into_inner().map_err(fail)?.finish().map_err(fail)?;

    tracing::info!(archive = %archive_path.display(), entries = names.len(), "log file created");
    Ok((archive_path, names.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn archived_names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn protected_files_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.stdout"), b"out").unwrap();
        std::fs::write(dir.path().join("HITS.pool.root"), b"hits").unwrap();
        std::fs::create_dir(dir.path().join("athenaMP")).unwrap();
        std::fs::write(dir.path().join("athenaMP").join("worker.log"), b"w").unwrap();

        let (path, count) = pack_logs(dir.path(), vec!["HITS.pool.root".into()], "log.tgz")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("log.tgz"));
        assert_eq!(count, 2);
        let names = archived_names(&path);
        assert!(names.contains(&"payload.stdout".to_string()));
        assert!(names.contains(&"athenaMP/worker.log".to_string()));
        assert!(!names.iter().any(|n| n.contains("HITS")));
        assert!(!names.iter().any(|n| n.contains("log.tgz")));
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("core.*", "core.12345"));
        assert!(wildcard_match("*.pyc", "util.pyc"));
        assert!(wildcard_match("core", "core"));
        assert!(wildcard_match("tmp?.dat", "tmp1.dat"));
        assert!(!wildcard_match("core.*", "core"));
        assert!(!wildcard_match("*.pyc", "util.py"));
        assert!(!wildcard_match("tmp?.dat", "tmp12.dat"));
    }

    #[tokio::test]
    async fn redundant_files_are_removed_unless_protected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("core.4711"), b"dump").unwrap();
        std::fs::write(dir.path().join("core.keep"), b"dump").unwrap();
        std::fs::write(dir.path().join("payload.stdout"), b"out").unwrap();
        std::fs::create_dir(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__").join("m.pyc"), b"x").unwrap();

        let removed = remove_redundant_files(
            dir.path(),
            vec!["core.*".into(), "__pycache__".into()],
            vec!["core.keep".into()],
        )
        .await
        .unwrap();

        assert_eq!(removed, 2);
        assert!(!dir.path().join("core.4711").exists());
        assert!(!dir.path().join("__pycache__").exists());
        assert!(dir.path().join("core.keep").exists());
        assert!(dir.path().join("payload.stdout").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_log_creation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = pack_logs(&dir.path().join("gone"), Vec::new(), "log.tgz")
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::LogFileCreation(_)));
    }
}
