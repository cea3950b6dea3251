//! Content digest for retrieved packages.
//!
//! The per-package hash is the Go-modules directory hash: one
//! `"SHA256(file)  prefix/path\n"` line per file, sorted by the prefixed
//! path, hashed again with SHA-256 and armored as `h1:<base64>`. Matching
//! that format keeps pins verifiable with stock tooling.

use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine as _;
use path_slash::PathExt as _;
use sha2::{Digest, Sha256};

/// Hash the tree at `root`, identifying it as `prefix` (`url@version`).
///
/// `.`-prefixed top-level directories are skipped, so a package's own
/// `.git` never contributes to its digest.
pub fn dir_digest(prefix: &str, root: &Path) -> anyhow::Result<String> {
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    collect(root, root, true, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut outer = Sha256::new();
    for (rel, path) in entries {
        let content = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_hash = Sha256::digest(&content);
        outer.update(format!("{file_hash:x}  {prefix}/{rel}\n"));
    }
    let sum = outer.finalize();
    Ok(format!(
        "h1:{}",
        base64::engine::general_purpose::STANDARD.encode(sum)
    ))
}

fn collect(
    root: &Path,
    dir: &Path,
    top_level: bool,
    out: &mut Vec<(String, PathBuf)>,
) -> anyhow::Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if top_level && entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            collect(root, &path, false, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_slash_lossy()
                .into_owned();
            out.push((rel, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let p = dir.path().join(path);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, content).unwrap();
        }
        dir
    }

    #[test]
    fn digest_is_deterministic() {
        let a = write_tree(&[("x.txt", "x"), ("sub/y.txt", "y")]);
        let b = write_tree(&[("sub/y.txt", "y"), ("x.txt", "x")]);
        let da = dir_digest("example.com/p@v1", a.path()).unwrap();
        let db = dir_digest("example.com/p@v1", b.path()).unwrap();
        assert_eq!(da, db);
        assert!(da.starts_with("h1:"), "{da}");
        assert_eq!(da.len(), "h1:".len() + 44);
    }

    #[test]
    fn digest_depends_on_content_and_prefix() {
        let a = write_tree(&[("x.txt", "x")]);
        let b = write_tree(&[("x.txt", "different")]);
        let base = dir_digest("example.com/p@v1", a.path()).unwrap();
        assert_ne!(base, dir_digest("example.com/p@v1", b.path()).unwrap());
        assert_ne!(base, dir_digest("example.com/p@v2", a.path()).unwrap());
    }

    #[test]
    fn dot_directories_at_top_level_are_skipped() {
        let a = write_tree(&[("x.txt", "x")]);
        let b = write_tree(&[("x.txt", "x"), (".git/HEAD", "ref"), (".cache/z", "z")]);
        assert_eq!(
            dir_digest("example.com/p@v1", a.path()).unwrap(),
            dir_digest("example.com/p@v1", b.path()).unwrap()
        );
        // Nested dot directories still count.
        let c = write_tree(&[("x.txt", "x"), ("sub/.hidden/z", "z")]);
        assert_ne!(
            dir_digest("example.com/p@v1", a.path()).unwrap(),
            dir_digest("example.com/p@v1", c.path()).unwrap()
        );
    }
}
