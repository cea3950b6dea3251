//! Raw directory tree fallback.
//!
//! Used when the root is not inside a git checkout. Every file is
//! "untracked", `affected_files` and `all_files` are the same listing, and
//! `new_lines` is the whole file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use path_slash::PathExt as _;

use super::{Action, FileList, NumberedLine, Scm, ScmFile, whole_file_lines};
use crate::cancel;

/// An SCM view over a plain directory.
pub struct RawTree {
    root: PathBuf,
    files: Mutex<Option<FileList>>,
}

impl RawTree {
    pub fn new(root: &Path) -> anyhow::Result<RawTree> {
        let root = dunce::canonicalize(root)
            .with_context(|| format!("failed to canonicalize {}", root.display()))?;
        Ok(RawTree {
            root,
            files: Mutex::new(None),
        })
    }

    fn walk(&self) -> anyhow::Result<FileList> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?
            {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    // A stray .git directory would make the listing depend on
                    // unrelated history; skip it like the git backend does.
                    if entry.file_name() == ".git" {
                        continue;
                    }
                    stack.push(path);
                } else if file_type.is_file() {
                    let rel = path
                        .strip_prefix(&self.root)
                        .expect("walked path is under root")
                        .to_slash_lossy()
                        .into_owned();
                    files.push(Arc::new(ScmFile::new(rel, Action::Untracked)));
                }
            }
        }
        files.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(Arc::new(files))
    }

    fn files(&self) -> anyhow::Result<FileList> {
        cancel::current().check()?;
        let mut cached = self.files.lock().unwrap();
        if let Some(files) = cached.as_ref() {
            return Ok(files.clone());
        }
        let files = self.walk()?;
        *cached = Some(files.clone());
        Ok(files)
    }
}

impl Scm for RawTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn affected_files(&self, _include_deleted: bool) -> anyhow::Result<FileList> {
        self.files()
    }

    fn all_files(&self, _include_deleted: bool) -> anyhow::Result<FileList> {
        self.files()
    }

    fn new_lines(&self, file: &ScmFile) -> anyhow::Result<Vec<NumberedLine>> {
        cancel::current().check()?;
        whole_file_lines(&self.root.join(file.root_path()))
    }
}
