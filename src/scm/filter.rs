//! SCM decorators: gitignore-style filtering and subdirectory views.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use super::{FileList, NumberedLine, Scm, ScmFile};

/// Wraps another SCM and drops files matching gitignore-style patterns.
pub struct IgnoreFiltered {
    inner: Arc<dyn Scm>,
    matcher: Gitignore,
    caches: Mutex<Caches>,
}

#[derive(Default)]
struct Caches {
    affected: HashMap<bool, FileList>,
    all: HashMap<bool, FileList>,
}

impl IgnoreFiltered {
    /// `patterns` uses gitignore syntax, matched against view-relative
    /// paths and each of their parent directories.
    pub fn new(inner: Arc<dyn Scm>, patterns: &[String]) -> anyhow::Result<IgnoreFiltered> {
        let mut builder = GitignoreBuilder::new(inner.root());
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("invalid ignore pattern {pattern:?}"))?;
        }
        let matcher = builder.build()?;
        Ok(IgnoreFiltered {
            inner,
            matcher,
            caches: Mutex::new(Caches::default()),
        })
    }

    fn filter(&self, files: &FileList) -> FileList {
        let kept: Vec<_> = files
            .iter()
            .filter(|f| {
                !self
                    .matcher
                    .matched_path_or_any_parents(Path::new(f.path()), false)
                    .is_ignore()
            })
            .cloned()
            .collect();
        Arc::new(kept)
    }
}

impl Scm for IgnoreFiltered {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn affected_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        let mut caches = self.caches.lock().unwrap();
        if let Some(cached) = caches.affected.get(&include_deleted) {
            return Ok(cached.clone());
        }
        let files = self.filter(&self.inner.affected_files(include_deleted)?);
        caches.affected.insert(include_deleted, files.clone());
        Ok(files)
    }

    fn all_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        let mut caches = self.caches.lock().unwrap();
        if let Some(cached) = caches.all.get(&include_deleted) {
            return Ok(cached.clone());
        }
        let files = self.filter(&self.inner.all_files(include_deleted)?);
        caches.all.insert(include_deleted, files.clone());
        Ok(files)
    }

    fn new_lines(&self, file: &ScmFile) -> anyhow::Result<Vec<NumberedLine>> {
        self.inner.new_lines(file)
    }
}

/// Restricts another SCM to files under `subdir/`, rewriting each file's
/// view-relative path. The original root-relative path is preserved so
/// diffs keep working.
pub struct SubdirView {
    inner: Arc<dyn Scm>,
    /// Normalized to end with `/`.
    prefix: String,
    root: PathBuf,
}

impl SubdirView {
    pub fn new(inner: Arc<dyn Scm>, subdir: &str) -> SubdirView {
        let trimmed = subdir.trim_matches('/');
        let root = inner.root().join(trimmed);
        SubdirView {
            inner,
            prefix: format!("{trimmed}/"),
            root,
        }
    }

    fn narrow(&self, files: FileList) -> FileList {
        let kept: Vec<_> = files
            .iter()
            .filter_map(|f| {
                f.path()
                    .strip_prefix(&self.prefix)
                    .map(|rel| Arc::new(f.with_view_path(rel.to_string())))
            })
            .collect();
        Arc::new(kept)
    }
}

impl Scm for SubdirView {
    fn root(&self) -> &Path {
        &self.root
    }

    fn affected_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        Ok(self.narrow(self.inner.affected_files(include_deleted)?))
    }

    fn all_files(&self, include_deleted: bool) -> anyhow::Result<FileList> {
        Ok(self.narrow(self.inner.all_files(include_deleted)?))
    }

    fn new_lines(&self, file: &ScmFile) -> anyhow::Result<Vec<NumberedLine>> {
        self.inner.new_lines(file)
    }
}
