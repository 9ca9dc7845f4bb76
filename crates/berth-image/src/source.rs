//! Build source fetchers.
//!
//! A build source is a git URL, a `.tar.gz` archive (local or over HTTP),
//! or an absolute local directory. Fetching populates a fresh directory
//! that becomes the root of the build.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use berth_common::error::{BerthError, Result};

use crate::library::{find_git, run_git};

/// The shape of a build source locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A repository to clone with submodules.
    Git(String),
    /// A gzip-compressed tarball at a URL.
    RemoteArchive(String),
    /// A gzip-compressed tarball on disk.
    LocalArchive(PathBuf),
    /// A directory to copy.
    Directory(PathBuf),
}

fn is_http(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_archive(source: &str) -> bool {
    source.ends_with(".tar.gz") || source.ends_with(".tgz")
}

impl SourceKind {
    /// Classifies a source locator.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] for an empty or unrecognized locator.
    pub fn classify(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(BerthError::config("build source is empty"));
        }
        if source.starts_with("git://") || (is_http(source) && source.ends_with(".git")) {
            return Ok(Self::Git(source.to_string()));
        }
        if is_archive(source) {
            return Ok(if is_http(source) {
                Self::RemoteArchive(source.to_string())
            } else {
                Self::LocalArchive(PathBuf::from(source))
            });
        }
        if Path::new(source).is_absolute() {
            return Ok(Self::Directory(PathBuf::from(source)));
        }
        Err(BerthError::config(format!(
            "unrecognized build source: {source}"
        )))
    }
}

/// Populates a directory from a source locator.
pub trait SourceFetcher: Send + Sync {
    /// Fetches `source` into the existing, empty `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the locator is unrecognized or the transfer fails.
    fn fetch(&self, source: &str, destination: &Path) -> Result<()>;
}

/// Fetches with git, HTTP, and the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFetcher;

impl SourceFetcher for DefaultFetcher {
    fn fetch(&self, source: &str, destination: &Path) -> Result<()> {
        match SourceKind::classify(source)? {
            SourceKind::Git(url) => clone_repository(&url, destination),
            SourceKind::RemoteArchive(url) => {
                tracing::info!(url = %url, "downloading source archive");
                let response = reqwest::blocking::get(&url)
                    .and_then(reqwest::blocking::Response::error_for_status)
                    .map_err(|e| BerthError::io(&url, std::io::Error::other(e)))?;
                extract_tar_gz(response, destination)
            }
            SourceKind::LocalArchive(path) => {
                let file = std::fs::File::open(&path).map_err(|e| BerthError::io(&path, e))?;
                extract_tar_gz(file, destination)
            }
            SourceKind::Directory(path) => copy_tree(&path, destination),
        }
    }
}

/// Clones `url` with submodules into `destination`.
///
/// # Errors
///
/// Returns an error if git is missing or the clone fails.
pub fn clone_repository(url: &str, destination: &Path) -> Result<()> {
    let git = find_git()?;
    tracing::info!(url, path = %destination.display(), "cloning source");
    let target = destination.to_string_lossy();
    let _ = run_git(&git, &["clone", "--recurse-submodules", url, &target])?;
    Ok(())
}

/// Extracts a gzip-compressed tarball into `destination`.
///
/// Entries whose path contains a `..` segment are rejected before anything
/// is written for them.
///
/// # Errors
///
/// Returns [`BerthError::PathTraversal`] for escaping entries, or an I/O
/// error if the stream is corrupt.
pub fn extract_tar_gz(reader: impl Read, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination).map_err(|e| BerthError::io(destination, e))?;
    let decoder = flate2::read::GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| BerthError::io(destination, e))?;
    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| BerthError::io(destination, e))?;
        let path = entry
            .path()
            .map_err(|e| BerthError::io(destination, e))?
            .into_owned();
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(BerthError::PathTraversal {
                entry: path.display().to_string(),
            });
        }
        let _ = entry
            .unpack_in(destination)
            .map_err(|e| BerthError::io(destination.join(&path), e))?;
        count += 1;
    }
    tracing::debug!(entries = count, target = %destination.display(), "archive extracted");
    Ok(())
}

/// Copies a directory tree, preserving file modes and symlinks.
///
/// # Errors
///
/// Returns an error if `source` is not a directory or a copy fails.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(BerthError::NotFound {
            kind: "source directory",
            id: source.display().to_string(),
        });
    }
    tracing::info!(from = %source.display(), to = %destination.display(), "copying source");

    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            BerthError::io(path, std::io::Error::other(e))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| BerthError::io(entry.path(), std::io::Error::other(e)))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| BerthError::io(&target, e))?;
            let perms = entry
                .metadata()
                .map_err(|e| BerthError::io(entry.path(), std::io::Error::other(e)))?
                .permissions();
            std::fs::set_permissions(&target, perms).map_err(|e| BerthError::io(&target, e))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(|e| BerthError::io(entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| BerthError::io(&target, e))?;
        } else {
            let _ = std::fs::copy(entry.path(), &target).map_err(|e| BerthError::io(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            let raw = name.as_bytes();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *data).expect("append");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
    }

    #[test]
    fn classify_source_shapes() {
        assert_eq!(
            SourceKind::classify("git://example.com/repo").expect("git"),
            SourceKind::Git("git://example.com/repo".into())
        );
        assert!(matches!(
            SourceKind::classify("https://github.com/a/b.git").expect("git"),
            SourceKind::Git(_)
        ));
        assert!(matches!(
            SourceKind::classify("https://example.com/src.tar.gz").expect("archive"),
            SourceKind::RemoteArchive(_)
        ));
        assert!(matches!(
            SourceKind::classify("/srv/src.tar.gz").expect("archive"),
            SourceKind::LocalArchive(_)
        ));
        assert!(matches!(
            SourceKind::classify("/opt/berth/coreenv/user").expect("dir"),
            SourceKind::Directory(_)
        ));
    }

    #[test]
    fn classify_rejects_unknown_and_empty() {
        let err = SourceKind::classify("ftp://example.com/src").unwrap_err();
        assert!(err.to_string().contains("ftp://example.com/src"));
        assert!(SourceKind::classify("  ").is_err());
        assert!(SourceKind::classify("relative/dir").is_err());
    }

    #[test]
    fn extract_writes_files_with_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = tar_gz(&[("bin/run.sh", b"#!/bin/sh\n")]);
        extract_tar_gz(&data[..], dir.path()).expect("extract");
        let path = dir.path().join("bin/run.sh");
        assert_eq!(std::fs::read(&path).expect("read"), b"#!/bin/sh\n");
        let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn extract_rejects_parent_segments() {
        let root = tempfile::tempdir().expect("tempdir");
        let dest = root.path().join("a").join("b");
        let data = tar_gz(&[("../../etc/passwd", b"root::0:0::/:/bin/sh\n")]);
        let err = extract_tar_gz(&data[..], &dest).unwrap_err();
        assert!(matches!(err, BerthError::PathTraversal { .. }), "got {err}");
        assert!(!root.path().join("etc").exists());
        assert_eq!(std::fs::read_dir(&dest).expect("read").count(), 0);
    }

    #[test]
    fn copy_tree_preserves_modes_and_links() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(src.path().join("sub")).expect("mkdir");
        let script = src.path().join("sub/run.sh");
        std::fs::write(&script, "echo hi\n").expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o750)).expect("chmod");
        std::os::unix::fs::symlink("sub/run.sh", src.path().join("link")).expect("symlink");

        copy_tree(src.path(), dst.path()).expect("copy");
        let copied = dst.path().join("sub/run.sh");
        assert_eq!(std::fs::read_to_string(&copied).expect("read"), "echo hi\n");
        let mode = std::fs::metadata(&copied).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(
            std::fs::read_link(dst.path().join("link")).expect("link"),
            PathBuf::from("sub/run.sh")
        );
    }

    #[test]
    fn fetch_local_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("src.tar.gz");
        std::fs::write(&archive, tar_gz(&[("Dockerfile", b"FROM scratch\n")])).expect("write");
        let dest = dir.path().join("out");
        DefaultFetcher
            .fetch(archive.to_str().expect("utf8"), &dest)
            .expect("fetch");
        assert!(dest.join("Dockerfile").is_file());
    }
}
