//! Official image library lookups.
//!
//! The official-images repository lists, per library image, which git
//! repository, commit, and directory hold the Dockerfile of each tag. A
//! [`LibraryCache`] keeps one shallow clone of that metadata for as long as
//! any build holds a [`LibraryLease`]; upstream repositories cloned through
//! it live in the same directory and go away with it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use berth_common::constants::LIBRARY_REPO_URL;
use berth_common::error::{BerthError, Result};
use tempfile::TempDir;

use crate::reference::ImageReference;

/// Finds the Dockerfile directory of a library image.
pub trait LibrarySource: Send + Sync {
    /// Returns a directory containing the `Dockerfile` for `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image or tag is unknown or its source cannot
    /// be fetched.
    fn library_source(&self, reference: &ImageReference) -> Result<PathBuf>;
}

/// One entry of a library manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Tags unique to this entry.
    pub tags: Vec<String>,
    /// Tags shared with other architectures' entries.
    pub shared_tags: Vec<String>,
    /// Repository holding the Dockerfile.
    pub git_repo: String,
    /// Commit to check out.
    pub git_commit: String,
    /// Directory of the Dockerfile inside the repository.
    pub directory: String,
}

/// A parsed `library/<name>` manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryManifest {
    entries: Vec<ManifestEntry>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_paragraphs(text: &str) -> Vec<Vec<(String, String)>> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = current.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

impl LibraryManifest {
    /// Parses the RFC 2822 style manifest format.
    ///
    /// The first paragraph holds defaults applied to every entry.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if no entry declares any tags.
    pub fn parse(text: &str) -> Result<Self> {
        let mut paragraphs = parse_paragraphs(text).into_iter();
        let mut defaults = ManifestEntry {
            directory: ".".into(),
            ..ManifestEntry::default()
        };
        let mut entries = Vec::new();

        let apply = |entry: &mut ManifestEntry, fields: Vec<(String, String)>| {
            for (key, value) in fields {
                match key.as_str() {
                    "tags" => entry.tags = split_list(&value),
                    "sharedtags" => entry.shared_tags = split_list(&value),
                    "gitrepo" => entry.git_repo = value,
                    "gitcommit" => entry.git_commit = value,
                    "directory" => entry.directory = value,
                    _ => {}
                }
            }
        };

        if let Some(header) = paragraphs.next() {
            let has_tags = header.iter().any(|(k, _)| k == "tags");
            if has_tags {
                let mut entry = defaults.clone();
                apply(&mut entry, header);
                entries.push(entry);
            } else {
                apply(&mut defaults, header);
            }
        }
        for fields in paragraphs {
            let mut entry = ManifestEntry {
                tags: Vec::new(),
                shared_tags: Vec::new(),
                ..defaults.clone()
            };
            apply(&mut entry, fields);
            entries.push(entry);
        }

        entries.retain(|e| !e.tags.is_empty() || !e.shared_tags.is_empty());
        if entries.is_empty() {
            return Err(BerthError::parse("library manifest declares no tags"));
        }
        Ok(Self { entries })
    }

    /// Returns the entry for `tag`, preferring unique tags over shared ones.
    #[must_use]
    pub fn entry_for_tag(&self, tag: &str) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| e.tags.iter().any(|t| t == tag))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.shared_tags.iter().any(|t| t == tag))
            })
    }
}

pub(crate) fn run_git(git: &Path, args: &[&str]) -> Result<String> {
    let command = format!("git {}", args.join(" "));
    tracing::debug!(command = %command, "running git");
    let output = Command::new(git)
        .args(args)
        .output()
        .map_err(|e| BerthError::io(git, e))?;
    if !output.status.success() {
        return Err(BerthError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Locates the git executable.
///
/// # Errors
///
/// Returns [`BerthError::NotFound`] if `git` is not on `PATH`.
pub fn find_git() -> Result<PathBuf> {
    which::which("git").map_err(|_| BerthError::NotFound {
        kind: "executable",
        id: "git".into(),
    })
}

/// Resolves library sources with the git command line.
#[derive(Debug)]
pub struct GitLibraryResolver {
    git: PathBuf,
    library_dir: PathBuf,
    repositories_dir: PathBuf,
    clone_lock: Mutex<()>,
}

impl GitLibraryResolver {
    /// Shallow-clones the official-images metadata into `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if git is missing or the clone fails.
    pub fn bootstrap(cache_dir: &Path) -> Result<Self> {
        let git = find_git()?;
        let metadata = cache_dir.join("official-images");
        tracing::info!(url = LIBRARY_REPO_URL, path = %metadata.display(), "cloning image library");
        let target = metadata.to_string_lossy();
        let _ = run_git(&git, &["clone", "--depth", "1", LIBRARY_REPO_URL, &target])?;
        Ok(Self::with_paths(git, metadata.join("library"), cache_dir.to_path_buf()))
    }

    /// Uses an existing metadata checkout.
    #[must_use]
    pub fn with_paths(git: PathBuf, library_dir: PathBuf, repositories_dir: PathBuf) -> Self {
        Self {
            git,
            library_dir,
            repositories_dir,
            clone_lock: Mutex::new(()),
        }
    }

    fn clone_library(&self, name: &str, url: &str) -> Result<PathBuf> {
        let repo = self.repositories_dir.join(format!("library-{name}"));
        if !repo.join(".git").is_dir() {
            let _ = std::fs::remove_dir_all(&repo);
            let target = repo.to_string_lossy();
            let _ = run_git(&self.git, &["clone", "--recurse-submodules", url, &target])?;
        }
        Ok(repo)
    }

    /// Returns a worktree of `repo` at `commit`, creating it once.
    ///
    /// A worktree is never moved to another commit, so a directory handed
    /// out stays valid while other tags of the same library resolve.
    fn worktree(&self, name: &str, repo: &Path, commit: &str) -> PathBuf {
        let tree = self.repositories_dir.join(format!("library-{name}@{commit}"));
        if tree.is_dir() {
            return tree;
        }
        let path = repo.to_string_lossy();
        let target = tree.to_string_lossy();
        let added = run_git(
            &self.git,
            &["-C", &path, "worktree", "add", "--detach", &target, commit],
        );
        if let Err(e) = added {
            let status = run_git(&self.git, &["-C", &path, "status", "--short", "--branch"])
                .unwrap_or_else(|_| "unknown".into());
            tracing::warn!(
                commit,
                error = %e,
                status = %status.trim(),
                "cannot check out library commit, using current tree"
            );
            return repo.to_path_buf();
        }
        if let Err(e) = run_git(
            &self.git,
            &["-C", &target, "submodule", "update", "--init", "--recursive"],
        ) {
            tracing::warn!(commit, error = %e, "cannot update library submodules");
        }
        tree
    }
}

impl LibrarySource for GitLibraryResolver {
    fn library_source(&self, reference: &ImageReference) -> Result<PathBuf> {
        let name = reference.library_name().ok_or_else(|| BerthError::NotFound {
            kind: "library image",
            id: reference.to_string(),
        })?;
        let manifest_path = self.library_dir.join(name);
        let text = std::fs::read_to_string(&manifest_path)
            .map_err(|e| BerthError::io(&manifest_path, e))?;
        let manifest = LibraryManifest::parse(&text)?;
        let entry = manifest
            .entry_for_tag(reference.tag())
            .ok_or_else(|| BerthError::NotFound {
                kind: "library tag",
                id: reference.to_string(),
            })?;
        tracing::debug!(image = %reference, repo = %entry.git_repo, commit = %entry.git_commit, "library entry");

        let _guard = self.clone_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let repo = self.clone_library(name, &entry.git_repo)?;
        let tree = if entry.git_commit.is_empty() {
            repo
        } else {
            self.worktree(name, &repo, &entry.git_commit)
        };
        Ok(tree.join(&entry.directory))
    }
}

type Bootstrap = Box<dyn Fn(&Path) -> Result<Arc<dyn LibrarySource>> + Send + Sync>;

#[derive(Default)]
struct CacheState {
    refs: usize,
    dir: Option<TempDir>,
    resolver: Option<Arc<dyn LibrarySource>>,
}

/// Reference-counted shared library checkout.
///
/// The first [`acquire`](Self::acquire) creates the cache directory and
/// bootstraps the resolver; dropping the last lease deletes the directory.
pub struct LibraryCache {
    parent: Option<PathBuf>,
    bootstrap: Bootstrap,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for LibraryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LibraryCache")
            .field("refs", &state.refs)
            .field("dir", &state.dir.as_ref().map(TempDir::path))
            .finish_non_exhaustive()
    }
}

static GLOBAL_CACHE: LazyLock<Arc<LibraryCache>> = LazyLock::new(|| {
    Arc::new(LibraryCache::new(|dir| {
        let resolver: Arc<dyn LibrarySource> = Arc::new(GitLibraryResolver::bootstrap(dir)?);
        Ok(resolver)
    }))
});

impl LibraryCache {
    /// Creates a cache whose directories live in the system temp dir.
    pub fn new(
        bootstrap: impl Fn(&Path) -> Result<Arc<dyn LibrarySource>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            parent: None,
            bootstrap: Box::new(bootstrap),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Creates a cache whose directories live under `parent`.
    pub fn new_in(
        parent: impl Into<PathBuf>,
        bootstrap: impl Fn(&Path) -> Result<Arc<dyn LibrarySource>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::new(bootstrap)
        }
    }

    /// Returns the process-wide cache backed by [`GitLibraryResolver`].
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_CACHE)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a lease, bootstrapping the cache if nobody holds one.
    ///
    /// Blocks while another caller bootstraps.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the bootstrap
    /// fails; the cache is then left empty.
    pub fn acquire(self: &Arc<Self>) -> Result<LibraryLease> {
        let mut state = self.lock();
        if state.refs == 0 {
            let parent = self.parent.clone().unwrap_or_else(std::env::temp_dir);
            let dir = tempfile::Builder::new()
                .prefix("berth-library-")
                .tempdir_in(&parent)
                .map_err(|e| BerthError::io(&parent, e))?;
            let resolver = (self.bootstrap)(dir.path())?;
            tracing::debug!(path = %dir.path().display(), "library cache created");
            state.dir = Some(dir);
            state.resolver = Some(resolver);
        }
        let resolver = state
            .resolver
            .clone()
            .ok_or_else(|| BerthError::runtime("library cache has no resolver"))?;
        state.refs += 1;
        Ok(LibraryLease {
            cache: Arc::clone(self),
            resolver,
        })
    }

    fn release(&self) {
        let mut state = self.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            state.resolver = None;
            if let Some(dir) = state.dir.take() {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    tracing::warn!(path = %path.display(), error = %e, "cannot remove library cache");
                } else {
                    tracing::debug!(path = %path.display(), "library cache removed");
                }
            }
        }
    }

    /// Returns the number of live leases.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.lock().refs
    }

    /// Returns the cache directory while any lease is live.
    #[must_use]
    pub fn directory(&self) -> Option<PathBuf> {
        self.lock().dir.as_ref().map(|d| d.path().to_path_buf())
    }
}

/// A live hold on a [`LibraryCache`]; released on drop.
pub struct LibraryLease {
    cache: Arc<LibraryCache>,
    resolver: Arc<dyn LibrarySource>,
}

impl std::fmt::Debug for LibraryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryLease").finish_non_exhaustive()
    }
}

impl LibrarySource for LibraryLease {
    fn library_source(&self, reference: &ImageReference) -> Result<PathBuf> {
        self.resolver.library_source(reference)
    }
}

impl Drop for LibraryLease {
    fn drop(&mut self) {
        self.cache.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const MANIFEST: &str = "\
# this file is generated
Maintainers: Someone <someone@example.com> (@someone)
GitRepo: https://github.com/alpinelinux/docker-alpine.git

Tags: 3.10.2, 3.10
Architectures: amd64, arm32v6
GitCommit: 0123abcd
Directory: x86_64

Tags: 3.9.4, 3.9
SharedTags: latest
GitCommit: 4567ef01
Directory: armhf
";

    #[test]
    fn manifest_entries_inherit_header() {
        let manifest = LibraryManifest::parse(MANIFEST).expect("parse");
        let entry = manifest.entry_for_tag("3.10").expect("entry");
        assert_eq!(entry.git_repo, "https://github.com/alpinelinux/docker-alpine.git");
        assert_eq!(entry.git_commit, "0123abcd");
        assert_eq!(entry.directory, "x86_64");
    }

    #[test]
    fn manifest_shared_tags_resolve() {
        let manifest = LibraryManifest::parse(MANIFEST).expect("parse");
        assert_eq!(manifest.entry_for_tag("latest").expect("entry").git_commit, "4567ef01");
        assert!(manifest.entry_for_tag("2.0").is_none());
    }

    #[test]
    fn manifest_without_tags_is_rejected() {
        assert!(LibraryManifest::parse("GitRepo: x\n").is_err());
    }

    struct Nothing;

    impl LibrarySource for Nothing {
        fn library_source(&self, reference: &ImageReference) -> Result<PathBuf> {
            Err(BerthError::NotFound {
                kind: "library tag",
                id: reference.to_string(),
            })
        }
    }

    fn git_in(git: &Path, dir: &Path, args: &[&str]) -> String {
        let path = dir.to_string_lossy().into_owned();
        let mut full: Vec<&str> = vec![
            "-C",
            path.as_str(),
            "-c",
            "user.name=berth",
            "-c",
            "user.email=berth@localhost",
            "-c",
            "commit.gpgsign=false",
        ];
        full.extend_from_slice(args);
        run_git(git, &full).expect("git").trim().to_string()
    }

    #[test]
    fn tags_of_one_library_resolve_to_separate_trees() {
        let Ok(git) = find_git() else {
            return;
        };
        let work = tempfile::tempdir().expect("tempdir");
        let upstream = work.path().join("upstream");
        std::fs::create_dir_all(upstream.join("img")).expect("mkdir");
        let _ = git_in(&git, &upstream, &["init", "--quiet"]);
        std::fs::write(upstream.join("img/Dockerfile"), "FROM scratch\n# one\n").expect("write");
        let _ = git_in(&git, &upstream, &["add", "."]);
        let _ = git_in(&git, &upstream, &["commit", "--quiet", "-m", "one"]);
        let first = git_in(&git, &upstream, &["rev-parse", "HEAD"]);
        std::fs::write(upstream.join("img/Dockerfile"), "FROM scratch\n# two\n").expect("write");
        let _ = git_in(&git, &upstream, &["commit", "--quiet", "-am", "two"]);
        let second = git_in(&git, &upstream, &["rev-parse", "HEAD"]);

        let library_dir = work.path().join("library");
        std::fs::create_dir_all(&library_dir).expect("mkdir");
        std::fs::write(
            library_dir.join("thing"),
            format!(
                "GitRepo: {}\nDirectory: img\n\nTags: 1\nGitCommit: {first}\n\nTags: 2\nGitCommit: {second}\n",
                upstream.display()
            ),
        )
        .expect("write manifest");
        let repos = work.path().join("repos");
        std::fs::create_dir_all(&repos).expect("mkdir");
        let resolver = GitLibraryResolver::with_paths(git, library_dir, repos);

        let one = resolver
            .library_source(&ImageReference::parse("thing:1").expect("ref"))
            .expect("tag 1");
        let two = resolver
            .library_source(&ImageReference::parse("thing:2").expect("ref"))
            .expect("tag 2");
        assert_ne!(one, two);
        let read = |dir: &Path| std::fs::read_to_string(dir.join("Dockerfile")).expect("read");
        assert!(read(&one).contains("# one"));
        assert!(read(&two).contains("# two"));
        let again = resolver
            .library_source(&ImageReference::parse("thing:1").expect("ref"))
            .expect("tag 1 again");
        assert_eq!(again, one);
        assert!(read(&two).contains("# two"));
    }

    #[test]
    fn directory_lives_until_last_release() {
        let parent = tempfile::tempdir().expect("tempdir");
        let boots = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&boots);
        let cache = Arc::new(LibraryCache::new_in(parent.path(), move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let resolver: Arc<dyn LibrarySource> = Arc::new(Nothing);
            Ok(resolver)
        }));

        let leases: Vec<_> = (0..3).map(|_| cache.acquire().expect("acquire")).collect();
        let dir = cache.directory().expect("dir");
        assert!(dir.is_dir());
        assert_eq!(cache.ref_count(), 3);
        assert_eq!(boots.load(Ordering::SeqCst), 1);

        let mut leases = leases.into_iter();
        drop(leases.next());
        drop(leases.next());
        assert!(dir.is_dir());
        drop(leases.next());
        assert!(!dir.exists());
        assert_eq!(cache.ref_count(), 0);
        assert!(cache.directory().is_none());

        let _again = cache.acquire().expect("acquire");
        assert_eq!(boots.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_bootstrap_leaves_no_directory() {
        let parent = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(LibraryCache::new_in(parent.path(), |_| {
            Err(BerthError::Command {
                command: "git clone".into(),
                message: "network unreachable".into(),
            })
        }));
        assert!(cache.acquire().is_err());
        assert_eq!(cache.ref_count(), 0);
        assert_eq!(std::fs::read_dir(parent.path()).expect("read").count(), 0);
    }

    #[test]
    fn concurrent_acquires_share_one_bootstrap() {
        let parent = tempfile::tempdir().expect("tempdir");
        let boots = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&boots);
        let cache = Arc::new(LibraryCache::new_in(parent.path(), move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            let resolver: Arc<dyn LibrarySource> = Arc::new(Nothing);
            Ok(resolver)
        }));
        let (tx, rx) = std::sync::mpsc::channel();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let lease = cache.acquire().expect("acquire");
                    tx.send(()).expect("send");
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    drop(lease);
                })
            })
            .collect();
        for _ in 0..4 {
            rx.recv().expect("recv");
        }
        for h in handles {
            h.join().expect("join");
        }
        assert!(boots.load(Ordering::SeqCst) >= 1);
        assert_eq!(cache.ref_count(), 0);
        assert!(cache.directory().is_none());
    }
}
