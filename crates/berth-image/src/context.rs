//! Build context packing.

use std::path::Path;

use berth_common::constants::DOCKERIGNORE_FILE;
use berth_common::error::{BerthError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// A tarred build context ready to send to the runtime.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Uncompressed tar archive.
    pub archive: Vec<u8>,
    /// Path of the injected Dockerfile inside the archive.
    pub dockerfile: String,
}

fn load_ignore(dir: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(dir);
    let path = dir.join(DOCKERIGNORE_FILE);
    if path.is_file() {
        if let Some(e) = builder.add(&path) {
            return Err(BerthError::parse(format!("{}: {e}", path.display())));
        }
    }
    builder
        .build()
        .map_err(|e| BerthError::parse(format!("{}: {e}", path.display())))
}

/// Tars `dir` honoring its `.dockerignore` and adds `dockerfile_text` as a
/// uniquely named entry.
///
/// `dockerfile` names the Dockerfile relative to `dir`; it and the ignore
/// file are always included so the runtime sees them.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or the ignore file is
/// malformed.
pub fn pack_context(dir: &Path, dockerfile: &Path, dockerfile_text: &str) -> Result<BuildContext> {
    let ignore = load_ignore(dir)?;
    let keep_dockerfile = dockerfile.strip_prefix("./").unwrap_or(dockerfile);
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1);
    let mut files = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| BerthError::io(dir, std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| BerthError::io(entry.path(), std::io::Error::other(e)))?;
        let is_dir = entry.file_type().is_dir();
        let always = relative == keep_dockerfile || relative == Path::new(DOCKERIGNORE_FILE);
        if !always && ignore.matched_path_or_any_parents(relative, is_dir).is_ignore() {
            continue;
        }
        if is_dir {
            builder
                .append_dir(relative, entry.path())
                .map_err(|e| BerthError::io(entry.path(), e))?;
        } else {
            builder
                .append_path_with_name(entry.path(), relative)
                .map_err(|e| BerthError::io(entry.path(), e))?;
            files += 1;
        }
    }

    let name = format!(".dockerfile.{}", uuid::Uuid::new_v4().simple());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile_text.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, &name, dockerfile_text.as_bytes())
        .map_err(|e| BerthError::io(dir, e))?;

    let archive = builder.into_inner().map_err(|e| BerthError::io(dir, e))?;
    tracing::debug!(path = %dir.display(), files, bytes = archive.len(), "packed build context");
    Ok(BuildContext {
        archive,
        dockerfile: name,
    })
}
