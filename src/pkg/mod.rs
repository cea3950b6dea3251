//! Dependency retrieval.
//!
//! Declared dependencies are materialized into a scratch root (fetched from
//! their git remote, or taken from the vendored tree when `vendor_path` is
//! set), verified against the pinned `h1:` digest, and exposed as read-only
//! file trees keyed by URL and optional alias. The `__main__` package — the
//! checkout itself — is always present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::doc::Document;
use crate::scm::cmd::git;

mod digest;

pub use digest::dir_digest;

/// Name of the package holding the checkout under analysis.
pub const MAIN_PKG: &str = "__main__";

/// Read-only file trees for the run, keyed by package name.
#[derive(Debug)]
pub struct PackageSet {
    roots: HashMap<String, PathBuf>,
}

impl PackageSet {
    /// A set containing only `__main__`.
    pub fn main_only(root: &Path) -> PackageSet {
        let mut roots = HashMap::new();
        roots.insert(MAIN_PKG.to_string(), root.to_path_buf());
        PackageSet { roots }
    }

    pub fn root_of(&self, name: &str) -> Option<&Path> {
        self.roots.get(name).map(PathBuf::as_path)
    }

    fn insert(&mut self, name: &str, root: &Path) -> anyhow::Result<()> {
        if self
            .roots
            .insert(name.to_string(), root.to_path_buf())
            .is_some()
        {
            bail!("package name {name:?} is not unique");
        }
        Ok(())
    }
}

/// Retrieve every declared dependency.
///
/// `main_root` is the checkout root; `scratch` is a run-scoped directory
/// that outlives the returned set. Digest verification failures abort
/// retrieval and leave no entry for the offending URL.
pub fn retrieve(doc: &Document, main_root: &Path, scratch: &Path) -> anyhow::Result<PackageSet> {
    let mut packages = PackageSet::main_only(main_root);
    if doc.requirements.direct.is_empty() && doc.requirements.indirect.is_empty() {
        return Ok(packages);
    }

    let fetch_root = scratch.join("pkg");
    std::fs::create_dir_all(&fetch_root)
        .with_context(|| format!("failed to create {}", fetch_root.display()))?;

    for (i, dep) in doc.requirements.iter().enumerate() {
        let root = match &doc.vendor_path {
            Some(vendor) => {
                let root = main_root.join(vendor).join(&dep.url);
                if !root.is_dir() {
                    bail!(
                        "dependency {} is not vendored at {}",
                        dep.url,
                        root.display()
                    );
                }
                root
            }
            None => fetch(&fetch_root, i, &dep.url, &dep.version)?,
        };

        let want = doc
            .digest_for(&dep.url, &dep.version)
            .expect("validated document pins every dependency");
        let got = dir_digest(&format!("{}@{}", dep.url, dep.version), &root)?;
        if got != want {
            bail!(
                "{}@{}: mismatched digest, got {got}, expected {want}",
                dep.url,
                dep.version
            );
        }

        packages.insert(&dep.url, &root)?;
        if let Some(alias) = &dep.alias {
            if alias == MAIN_PKG {
                bail!("alias {MAIN_PKG:?} is reserved");
            }
            packages.insert(alias, &root)?;
        }
    }
    Ok(packages)
}

/// Shallow-fetch `url` at `version` into a fresh directory.
fn fetch(fetch_root: &Path, index: usize, url: &str, version: &str) -> anyhow::Result<PathBuf> {
    let dest = fetch_root.join(index.to_string());
    std::fs::create_dir_all(&dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let remote = format!("https://{url}");
    git(&dest, &["init", "-q"])?;
    git(&dest, &["remote", "add", "origin", &remote])?;
    git(&dest, &["fetch", "--quiet", "--depth", "1", "origin", version])
        .with_context(|| format!("failed to fetch {url}@{version}"))?;
    git(&dest, &["checkout", "-q", "FETCH_HEAD"])?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Dependency, Known, Requirements, Sum, VersionDigest};

    fn vendored_doc(url: &str, alias: Option<&str>, digest: &str) -> Document {
        Document {
            vendor_path: Some("vendor".into()),
            requirements: Requirements {
                direct: vec![Dependency {
                    url: url.into(),
                    alias: alias.map(String::from),
                    version: "v1".into(),
                }],
                indirect: vec![],
            },
            sum: Sum {
                known: vec![Known {
                    url: url.into(),
                    seen: vec![VersionDigest {
                        version: "v1".into(),
                        digest: digest.into(),
                    }],
                }],
            },
            ..Document::default()
        }
    }

    fn vendored_tree(url: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let dep = dir.path().join("vendor").join(url);
        std::fs::create_dir_all(&dep).unwrap();
        std::fs::write(dep.join("api.star"), "# dep\n").unwrap();
        dir
    }

    #[test]
    fn main_is_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let packages = PackageSet::main_only(dir.path());
        assert_eq!(packages.root_of(MAIN_PKG), Some(dir.path()));
        assert_eq!(packages.root_of("example.com/dep"), None);
    }

    #[test]
    fn vendored_dependency_with_matching_digest() {
        let url = "example.com/dep";
        let main = vendored_tree(url);
        let dep_root = main.path().join("vendor").join(url);
        let digest = dir_digest(&format!("{url}@v1"), &dep_root).unwrap();
        let doc = vendored_doc(url, Some("dep"), &digest);
        let scratch = tempfile::tempdir().unwrap();
        let packages = retrieve(&doc, main.path(), scratch.path()).unwrap();
        assert_eq!(packages.root_of(url), Some(dep_root.as_path()));
        assert_eq!(packages.root_of("dep"), Some(dep_root.as_path()));
    }

    #[test]
    fn mismatched_digest_aborts_with_both_values() {
        let url = "example.com/dep";
        let main = vendored_tree(url);
        let pinned = "h1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        let doc = vendored_doc(url, None, pinned);
        let scratch = tempfile::tempdir().unwrap();
        let err = retrieve(&doc, main.path(), scratch.path()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("mismatched digest, got h1:"), "{msg}");
        assert!(msg.contains(&format!("expected {pinned}")), "{msg}");
    }

    #[test]
    fn missing_vendored_tree_is_an_error() {
        let url = "example.com/dep";
        let main = tempfile::tempdir().unwrap();
        let doc = vendored_doc(url, None, "h1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        let scratch = tempfile::tempdir().unwrap();
        let err = retrieve(&doc, main.path(), scratch.path()).unwrap_err();
        assert!(format!("{err:#}").contains("not vendored"));
    }
}
