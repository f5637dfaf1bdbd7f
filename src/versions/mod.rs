//! Version registry.
//!
//! Holds every branch and tag that has documentation, in display order, and
//! the distinguished members templates highlight (most recent overall, most
//! recent branch, most recent tag, greatest version tag).
//!
//! The registry is built once per run. Entries only ever leave it: a version
//! whose build fails is removed and the remaining ones are rebuilt.

pub mod links;
pub mod sort;

use serde::{Deserialize, Serialize};
use sort::{SortPolicy, composite_sort};
use std::{collections::BTreeSet, fmt};
use thiserror::Error;

/// Url of a version that has not been placed yet. The root keeps it.
pub const UNPLACED_URL: &str = ".";

/// Default primary page of a version.
pub const DEFAULT_PRIMARY_PAGE: &str = "contents";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown version `{0}`")]
    NotFound(String),

    #[error("version index {index} out of range ({len} versions)")]
    IndexOutOfRange { index: i64, len: usize },
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    Branch,
    Tag,
}

impl VersionKind {
    /// Ref namespace under `refs/`.
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Branch => "heads",
            Self::Tag => "tags",
        }
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Branch => "branch",
            Self::Tag => "tag",
        })
    }
}

/// Group to move to the front of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Branches,
    Tags,
}

impl Priority {
    fn rank(self, kind: VersionKind) -> u8 {
        match (self, kind) {
            (Self::Branches, VersionKind::Branch) | (Self::Tags, VersionKind::Tag) => 0,
            _ => 1,
        }
    }
}

/// A remote branch or tag whose commit contains documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub sha: String,
    pub name: String,
    pub kind: VersionKind,
    /// Seconds since epoch.
    pub commit_time: i64,
    /// Path of the docs config file in that commit, relative to the repo root.
    pub doc_root_path: String,
}

/// One version in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionEntry {
    /// `heads/<name>` or `tags/<name>`.
    pub id: String,
    pub sha: String,
    pub name: String,
    pub kind: VersionKind,
    pub commit_time: i64,
    #[serde(skip)]
    pub doc_root_path: String,
    /// Pages the engine found in this version. Filled during discovery.
    #[serde(skip)]
    pub found_pages: BTreeSet<String>,
    pub primary_page: String,
    /// Directory holding this version's output, empty for the root.
    pub root_dir: String,
    /// Root-relative url of the primary page once placed.
    pub url: String,
}

impl VersionEntry {
    pub fn new(remote: RemoteRef, primary_page: &str) -> Self {
        Self {
            id: format!("{}/{}", remote.kind.namespace(), remote.name),
            sha: remote.sha,
            name: remote.name,
            kind: remote.kind,
            commit_time: remote.commit_time,
            doc_root_path: remote.doc_root_path,
            found_pages: BTreeSet::new(),
            primary_page: primary_page.to_owned(),
            root_dir: String::new(),
            url: UNPLACED_URL.to_owned(),
        }
    }

    /// Put this version under `root_dir` (empty for the root) with the given
    /// primary page. A leading `./` on the page is dropped.
    pub fn place(&mut self, root_dir: &str, primary_page: &str) {
        let primary = primary_page.trim_start_matches("./");
        self.url = if root_dir.is_empty() {
            format!("{primary}.html")
        } else {
            format!("{root_dir}/{primary}.html")
        };
        self.root_dir = root_dir.to_owned();
        self.primary_page = primary.to_owned();
    }

    /// Output directory relative to the destination, empty for the root.
    pub fn dir(&self) -> &str {
        &self.root_dir
    }

    /// Directory of the docs config file inside an export of this commit.
    pub fn source_dir(&self) -> &str {
        self.doc_root_path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    pub fn is_branch(&self) -> bool {
        self.kind == VersionKind::Branch
    }

    pub fn is_tag(&self) -> bool {
        self.kind == VersionKind::Tag
    }
}

// ============================================================================
// Lookup keys
// ============================================================================

/// Anything a version can be looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey<'a> {
    /// Id, sha, name or sha prefix.
    Text(&'a str),
    /// Commit time or position.
    Int(i64),
}

impl<'a> From<&'a str> for VersionKey<'a> {
    fn from(s: &'a str) -> Self {
        Self::Text(s)
    }
}

impl<'a> From<&'a String> for VersionKey<'a> {
    fn from(s: &'a String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for VersionKey<'_> {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl fmt::Display for VersionKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
        }
    }
}

/// Shortest key tried as a sha prefix.
const MIN_SHA_PREFIX: usize = 5;

// ============================================================================
// Registry
// ============================================================================

/// Boolean flags of one version, as exposed to templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionFlags {
    pub is_branch: bool,
    pub is_tag: bool,
    pub is_root: bool,
    pub is_recent: bool,
    pub is_recent_branch: bool,
    pub is_recent_tag: bool,
    pub is_greatest_tag: bool,
}

/// Ordered collection of versions plus derived pointers.
///
/// Derived pointers are ids computed at construction. They are not refreshed
/// by [`VersionRegistry::remove`], so a pointer may name a version that is no
/// longer present.
#[derive(Debug, Clone, Default)]
pub struct VersionRegistry {
    entries: Vec<VersionEntry>,
    root: Option<String>,
    recent: Option<String>,
    recent_branch: Option<String>,
    recent_tag: Option<String>,
    greatest_tag: Option<String>,
    /// Directory levels between this view's pages and the destination root.
    depth: usize,
}

impl VersionRegistry {
    /// Sort, group and optionally invert `remotes`, then derive pointers.
    pub fn build(
        remotes: Vec<RemoteRef>,
        policies: &[SortPolicy],
        priority: Option<Priority>,
        invert: bool,
        primary_page: &str,
    ) -> Self {
        let mut entries: Vec<VersionEntry> = remotes
            .into_iter()
            .map(|r| VersionEntry::new(r, primary_page))
            .collect();

        composite_sort(&mut entries, policies);

        if let Some(priority) = priority {
            entries.sort_by_key(|e| priority.rank(e.kind));
        }

        if invert {
            entries.reverse();
        }

        let mut registry = Self {
            entries,
            ..Self::default()
        };
        registry.derive_pointers();
        registry
    }

    fn derive_pointers(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let mut by_time = self.entries.clone();
        composite_sort(&mut by_time, &[SortPolicy::Chrono]);
        self.recent = by_time.first().map(|e| e.id.clone());
        self.recent_branch = by_time.iter().find(|e| e.is_branch()).map(|e| e.id.clone());
        self.recent_tag = by_time.iter().find(|e| e.is_tag()).map(|e| e.id.clone());

        if self.recent_tag.is_some() {
            composite_sort(&mut by_time, &[SortPolicy::Semver]);
            self.greatest_tag = by_time
                .iter()
                .find(|e| e.is_tag())
                .filter(|e| sort::is_semver(&e.name))
                .map(|e| e.id.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Position of the version matching `key`.
    ///
    /// Text keys match id, then sha, then name, then sha prefix (at least 5
    /// chars). Integer keys match commit time, then position.
    pub fn position<'k>(&self, key: impl Into<VersionKey<'k>>) -> Result<usize, RegistryError> {
        let key = key.into();
        match key {
            VersionKey::Text(text) => {
                let found = self
                    .find(|e| e.id == text)
                    .or_else(|| self.find(|e| e.sha == text))
                    .or_else(|| self.find(|e| e.name == text))
                    .or_else(|| {
                        (text.chars().count() >= MIN_SHA_PREFIX)
                            .then(|| self.find(|e| e.sha.starts_with(text)))
                            .flatten()
                    });
                found.ok_or_else(|| RegistryError::NotFound(text.to_owned()))
            }
            VersionKey::Int(n) => {
                if let Some(i) = self.find(|e| e.commit_time == n) {
                    return Ok(i);
                }
                usize::try_from(n)
                    .ok()
                    .filter(|&i| i < self.entries.len())
                    .ok_or(RegistryError::IndexOutOfRange {
                        index: n,
                        len: self.entries.len(),
                    })
            }
        }
    }

    fn find(&self, pred: impl Fn(&VersionEntry) -> bool) -> Option<usize> {
        self.entries.iter().position(pred)
    }

    pub fn lookup<'k>(&self, key: impl Into<VersionKey<'k>>) -> Result<&VersionEntry, RegistryError> {
        Ok(&self.entries[self.position(key)?])
    }

    pub fn lookup_mut<'k>(
        &mut self,
        key: impl Into<VersionKey<'k>>,
    ) -> Result<&mut VersionEntry, RegistryError> {
        let i = self.position(key)?;
        Ok(&mut self.entries[i])
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Mark the version matching `key` as root.
    pub fn set_root<'k>(&mut self, key: impl Into<VersionKey<'k>>) -> Result<(), RegistryError> {
        let i = self.position(key)?;
        self.root = Some(self.entries[i].id.clone());
        Ok(())
    }

    /// Remove the version matching `key`. Derived pointers are left alone.
    pub fn remove<'k>(&mut self, key: impl Into<VersionKey<'k>>) -> Result<VersionEntry, RegistryError> {
        let i = self.position(key)?;
        Ok(self.entries.remove(i))
    }

    /// Deep copy whose links are computed `depth` directories below the root.
    pub fn sub_view(&self, depth: usize) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn entries(&self) -> &[VersionEntry] {
        &self.entries
    }

    /// `(name, url)` of every version in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.url.as_str()))
    }

    /// `(name, url)` of every branch in order.
    pub fn branches(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|e| e.is_branch())
            .map(|e| (e.name.as_str(), e.url.as_str()))
    }

    /// `(name, url)` of every tag in order.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|e| e.is_tag())
            .map(|e| (e.name.as_str(), e.url.as_str()))
    }

    /// Names of all versions, space separated. Used in log lines.
    pub fn names(&self) -> String {
        self.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(" ")
    }

    pub fn root(&self) -> Option<&VersionEntry> {
        self.root.as_deref().and_then(|id| self.lookup(id).ok())
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn is_root(&self, entry: &VersionEntry) -> bool {
        self.root.as_deref() == Some(entry.id.as_str())
    }

    pub fn recent_id(&self) -> Option<&str> {
        self.recent.as_deref()
    }

    pub fn recent_branch_id(&self) -> Option<&str> {
        self.recent_branch.as_deref()
    }

    pub fn recent_tag_id(&self) -> Option<&str> {
        self.recent_tag.as_deref()
    }

    pub fn greatest_tag_id(&self) -> Option<&str> {
        self.greatest_tag.as_deref()
    }

    /// Dereference a derived pointer. Fails if its version was removed.
    pub fn resolve_pointer(&self, id: Option<&str>) -> Result<Option<&VersionEntry>, RegistryError> {
        id.map(|id| self.lookup(id)).transpose()
    }

    pub fn flags(&self, entry: &VersionEntry) -> VersionFlags {
        let is = |ptr: &Option<String>| ptr.as_deref() == Some(entry.id.as_str());
        VersionFlags {
            is_branch: entry.is_branch(),
            is_tag: entry.is_tag(),
            is_root: is(&self.root),
            is_recent: is(&self.recent),
            is_recent_branch: is(&self.recent_branch),
            is_recent_tag: is(&self.recent_tag),
            is_greatest_tag: is(&self.greatest_tag),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
