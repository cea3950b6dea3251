//! The parsed configuration document and its validator.
//!
//! The on-disk serialization format is the embedder's business; the engine
//! consumes an already-parsed [`Document`] (the structs derive
//! `serde::Deserialize`, so any self-describing format works) and validates
//! it before any script loads: version compatibility, dependency URL shape,
//! alias uniqueness, digest format, and the cross-reference between declared
//! dependencies and pinned digests.

use std::collections::HashSet;

use anyhow::{Context, bail};
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Parsed configuration document, frozen for the run after validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Document {
    /// Minimum engine version, `"M.m.p"`. The run refuses to start on an
    /// older engine.
    pub min_shac_version: Option<String>,
    /// Permit `allow_network=true` in `ctx.os.exec`.
    pub allow_network: bool,
    /// Mount the checkout writable into sandboxes.
    pub writable_root: bool,
    /// Gitignore-style patterns filtering the SCM.
    pub ignore: Vec<String>,
    /// When set, dependencies resolve from this tree instead of being
    /// fetched.
    pub vendor_path: Option<String>,
    /// Declared runtime variables.
    pub vars: Vec<VarDecl>,
    /// Environment variables forwarded into sandboxes.
    pub passthrough_env: Vec<PassthroughEnv>,
    pub requirements: Requirements,
    pub sum: Sum,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VarDecl {
    pub name: String,
    pub default: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassthroughEnv {
    pub name: String,
    /// The value is a filesystem path that must also be mounted.
    pub is_path: bool,
    pub writeable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Requirements {
    pub direct: Vec<Dependency>,
    pub indirect: Vec<Dependency>,
}

impl Requirements {
    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.direct.iter().chain(self.indirect.iter())
    }
}

/// One declared dependency.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Dependency {
    /// Host + path, no scheme, no query, no fragment.
    pub url: String,
    pub alias: Option<String>,
    /// A commit hash, `pull/<n>/head`, `refs/changes/NN/NNN/NN`, or a
    /// git-tag-like string.
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Sum {
    pub known: Vec<Known>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Known {
    pub url: String,
    /// Sorted ascending by version.
    pub seen: Vec<VersionDigest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersionDigest {
    pub version: String,
    pub digest: String,
}

static COMMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{40,64}$").unwrap());
static GERRIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^refs/changes/\d{1,2}/\d{1,11}/\d{1,3}$").unwrap());
static PULL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^pull/\d+/head$").unwrap());

/// Characters that disqualify a version string from being a safe tag.
const UNSAFE_TAG_CHARS: &[char] = &[
    '$', '^', '[', ']', '{', '}', '"', '\'', '\\', ':', '+', '*', '<', '>', '=',
];

impl Document {
    /// Validate the whole document against `engine_version`.
    pub fn validate(&self, engine_version: (u32, u32, u32)) -> anyhow::Result<()> {
        if let Some(min) = &self.min_shac_version {
            let want = parse_version(min).context("min_shac_version")?;
            if want > engine_version {
                let (major, minor, patch) = engine_version;
                bail!(
                    "min_shac_version specifies unsupported version \"{min}\", running {major}.{minor}.{patch}"
                );
            }
        }
        for pattern in &self.ignore {
            if pattern.is_empty() {
                bail!("ignore: pattern must not be empty");
            }
        }
        if let Some(vendor) = &self.vendor_path {
            validate_clean_rel_path(vendor).context("vendor_path")?;
        }
        let mut var_names = HashSet::new();
        for var in &self.vars {
            if var.name.is_empty() {
                bail!("vars: name must not be empty");
            }
            if !var_names.insert(var.name.as_str()) {
                bail!("vars: duplicate name {:?}", var.name);
            }
        }
        let mut env_names = HashSet::new();
        for env in &self.passthrough_env {
            if env.name.is_empty() {
                bail!("passthrough_env: name must not be empty");
            }
            if !env_names.insert(env.name.as_str()) {
                bail!("passthrough_env: duplicate name {:?}", env.name);
            }
        }

        let mut urls = HashSet::new();
        let mut aliases = HashSet::new();
        for dep in self.requirements.iter() {
            dep.validate()?;
            if !urls.insert(dep.url.as_str()) {
                bail!("requirements: duplicate url {:?}", dep.url);
            }
            if let Some(alias) = &dep.alias {
                if alias.is_empty() {
                    bail!("requirements: alias must not be empty for {:?}", dep.url);
                }
                if !aliases.insert(alias.as_str()) {
                    bail!("requirements: duplicate alias {:?}", alias);
                }
            }
            if self.digest_for(&dep.url, &dep.version).is_none() {
                bail!(
                    "sum: no known digest for {}@{}, run the dependency update first",
                    dep.url,
                    dep.version
                );
            }
        }

        for known in &self.sum.known {
            let mut prev: Option<&str> = None;
            for seen in &known.seen {
                validate_digest(&seen.digest)
                    .with_context(|| format!("sum: {}@{}", known.url, seen.version))?;
                if let Some(p) = prev
                    && p >= seen.version.as_str()
                {
                    bail!("sum: {}: seen entries must be sorted by version", known.url);
                }
                prev = Some(&seen.version);
            }
        }
        Ok(())
    }

    /// The pinned digest for `url@version`, if any.
    pub fn digest_for(&self, url: &str, version: &str) -> Option<&str> {
        self.sum
            .known
            .iter()
            .find(|k| k.url == url)?
            .seen
            .iter()
            .find(|s| s.version == version)
            .map(|s| s.digest.as_str())
    }

    /// Declared default for a variable, if it exists.
    pub fn var_default(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.default.as_str())
    }
}

impl Dependency {
    fn validate(&self) -> anyhow::Result<()> {
        validate_url(&self.url).with_context(|| format!("requirements: {:?}", self.url))?;
        validate_version(&self.version)
            .with_context(|| format!("requirements: {}@{}", self.url, self.version))?;
        Ok(())
    }
}

fn validate_url(url: &str) -> anyhow::Result<()> {
    if url.contains("://") {
        bail!("url must not have a scheme");
    }
    if url.contains('?') || url.contains('#') {
        bail!("url must not have a query or fragment");
    }
    let Some((host, path)) = url.split_once('/') else {
        bail!("url must be host/path");
    };
    if host.is_empty() || !host.contains('.') {
        bail!("url must start with a host");
    }
    if path.is_empty() {
        bail!("url must have a path");
    }
    Ok(())
}

fn validate_version(version: &str) -> anyhow::Result<()> {
    if COMMIT_RE.is_match(version) || GERRIT_RE.is_match(version) || PULL_RE.is_match(version) {
        return Ok(());
    }
    if version.is_empty() {
        bail!("version must not be empty");
    }
    if version.contains("..") || version.contains(UNSAFE_TAG_CHARS) {
        bail!("version is not a commit, gerrit ref, pull ref or safe tag");
    }
    Ok(())
}

/// Digest format: `h1:` + base64 of 32 bytes.
fn validate_digest(digest: &str) -> anyhow::Result<()> {
    let Some(b64) = digest.strip_prefix("h1:") else {
        bail!("digest must start with \"h1:\"");
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .context("digest is not valid base64")?;
    if decoded.len() != 32 {
        bail!("digest must encode 32 bytes, got {}", decoded.len());
    }
    Ok(())
}

/// A relative path with only normal components.
fn validate_clean_rel_path(path: &str) -> anyhow::Result<()> {
    use std::path::Component;
    if path.is_empty() {
        bail!("path must not be empty");
    }
    for component in std::path::Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("path must be clean and relative, got {path:?}"),
        }
    }
    Ok(())
}

fn parse_version(s: &str) -> anyhow::Result<(u32, u32, u32)> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 3 {
        bail!("expected M.m.p, got {s:?}");
    }
    let parse = |p: &str| p.parse::<u32>().with_context(|| format!("bad component {p:?}"));
    Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
}
