//! Build orchestration.
//!
//! A run goes through these phases:
//!
//! 1. [`gather_git_info`]: list refs on `origin`, keep those with docs
//! 2. [`choose_root_ref`]: pick the version placed at the destination root
//! 3. [`export_all`]: write every unique commit into a temporary directory
//! 4. [`discover_urls`]: assign directories and read each version's pages
//! 5. [`build_all`]: build the root, then every other version below it
//!
//! Versions that fail steps 4 or 5 are dropped with a warning. A failing root
//! aborts the run.

use crate::{
    config::{Config, VersionsConfig},
    debug,
    engine::BuildEngine,
    log,
    utils::{
        git::{self, GitError, ListedRef},
        slug::assign_slug,
    },
    versions::{
        RemoteRef, VersionEntry, VersionKind, VersionRegistry,
        sort::{SortPolicy, composite_sort},
    },
};
use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

// ============================================================================
// Git info
// ============================================================================

/// Remote refs whose commits contain one of `candidates`, after whitelisting.
///
/// Commits missing locally are fetched once, then looked up again.
pub fn gather_git_info(
    root: &Path,
    candidates: &[String],
    branch_patterns: &[Regex],
    tag_patterns: &[Regex],
) -> Result<Vec<RemoteRef>> {
    log!("git"; "Getting list of all remote branches/tags...");
    let listed = git::list_remote(root)?;
    log!("git"; "Found: {}", names_of(listed.iter().map(|r| r.name.as_str())));

    let dates = match date_refs(root, candidates, &listed) {
        Ok(dates) => dates,
        Err(e) => {
            debug!("git"; "{}: {}", e.message, e.output);
            log!("git"; "Need to fetch from remote...");
            git::fetch_commits(root, &listed).context("Failed to fetch from remote.")?;
            date_refs(root, candidates, &listed)?
        }
    };

    let with_docs: Vec<RemoteRef> = listed
        .into_iter()
        .filter_map(|r| {
            let (commit_time, doc_root_path) = dates.get(&r.sha)?.clone();
            Some(RemoteRef {
                sha: r.sha,
                name: r.name,
                kind: r.kind,
                commit_time,
                doc_root_path,
            })
        })
        .collect();
    log!("git"; "With docs: {}", names_of(with_docs.iter().map(|r| r.name.as_str())));

    if branch_patterns.is_empty() && tag_patterns.is_empty() {
        return Ok(with_docs);
    }

    let passed = whitelist(with_docs, branch_patterns, tag_patterns);
    log!("git"; "Passed whitelisting: {}", names_of(passed.iter().map(|r| r.name.as_str())));
    Ok(passed)
}

fn date_refs(
    root: &Path,
    candidates: &[String],
    listed: &[ListedRef],
) -> Result<BTreeMap<String, (i64, String)>, GitError> {
    git::filter_and_date(root, candidates, listed.iter().map(|r| r.sha.as_str()))
}

/// Keep refs whose name matches one of the patterns of their kind.
///
/// An empty pattern list keeps every ref of that kind.
pub fn whitelist(remotes: Vec<RemoteRef>, branch_patterns: &[Regex], tag_patterns: &[Regex]) -> Vec<RemoteRef> {
    remotes
        .into_iter()
        .filter(|r| {
            let patterns = match r.kind {
                VersionKind::Branch => branch_patterns,
                VersionKind::Tag => tag_patterns,
            };
            patterns.is_empty() || patterns.iter().any(|p| p.is_match(&r.name))
        })
        .collect()
}

fn names_of<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Root selection
// ============================================================================

/// Id of the version to place at the destination root.
///
/// `greatest_tag` and `recent_tag` override `root_ref` when any tag has docs.
pub fn choose_root_ref(registry: &VersionRegistry, versions: &VersionsConfig) -> Result<String> {
    if versions.greatest_tag || versions.recent_tag {
        let mut tags: Vec<VersionEntry> = registry.entries().iter().filter(|e| e.is_tag()).cloned().collect();
        if tags.is_empty() {
            log!("warn"; "No git tags with docs found in remote. Falling back to --root-ref value.");
        } else {
            let policy = if versions.greatest_tag {
                SortPolicy::Semver
            } else {
                SortPolicy::Chrono
            };
            composite_sort(&mut tags, &[policy]);
            return Ok(tags.swap_remove(0).id);
        }
    }

    registry
        .lookup(versions.root_ref.as_str())
        .map(|e| e.id.clone())
        .map_err(|_| anyhow!("Root ref {} not found in: {}", versions.root_ref, registry.names()))
}

// ============================================================================
// Pre-build
// ============================================================================

/// Export every unique commit of `registry` into `<tempdir>/<sha>`.
pub fn export_all(root: &Path, registry: &VersionRegistry) -> Result<TempDir> {
    let exported = TempDir::new().context("Failed to create export directory")?;
    let mut seen = BTreeSet::new();

    for entry in registry.entries() {
        if seen.insert(entry.sha.as_str()) {
            debug!("git"; "exporting {} ({})", entry.sha, entry.name);
            git::export(root, &entry.sha, &exported.path().join(&entry.sha))?;
        }
    }
    Ok(exported)
}

/// Docs source directory of `entry` inside an export.
fn source_of(exported: &Path, entry: &VersionEntry) -> PathBuf {
    exported.join(&entry.sha).join(entry.source_dir())
}

/// Give every version a url and its list of pages.
///
/// The root is built once into a scratch directory so version directories
/// never shadow its top-level files. Non-root versions that fail discovery
/// are removed.
pub fn discover_urls(exported: &Path, registry: &mut VersionRegistry, engine: &dyn BuildEngine) -> Result<()> {
    let root = registry.root().cloned().context("No root version selected")?;

    log!("build"; "Pre-running the engine to collect each version's primary page and pages.");
    let scratch = TempDir::new().context("Failed to create scratch directory")?;
    engine
        .run_build(&source_of(exported, &root), scratch.path(), registry, &root.id)
        .context("Root version failed to build")?;

    let mut existing: Vec<String> = fs::read_dir(scratch.path())
        .with_context(|| format!("Failed to read `{}`", scratch.path().display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    existing.sort();

    let ids: Vec<String> = registry.entries().iter().map(|e| e.id.clone()).collect();
    for id in ids {
        let entry = registry.lookup(id.as_str())?.clone();
        let is_root = registry.is_root(&entry);
        let slug = (!is_root).then(|| assign_slug(&entry.name, &mut existing));

        let discovered = match engine.discover_config(&source_of(exported, &entry), &entry.name) {
            Ok(discovered) => discovered,
            Err(e) if is_root => return Err(e).context("Root version failed to build"),
            Err(e) => {
                log!("warn"; "{e}");
                log!("warn"; "Skipping. Will not be building {}.", entry.name);
                registry.remove(id.as_str())?;
                continue;
            }
        };

        let entry = registry.lookup_mut(id.as_str())?;
        entry.place(slug.as_deref().unwrap_or(""), &discovered.primary_page);
        entry.found_pages = discovered.found_pages;
        debug!("build"; "{} -> {}", entry.name, entry.url);
    }

    Ok(())
}

// ============================================================================
// Build
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    BuildingRoot,
    /// Index into the non-root versions.
    BuildingNonRoot(usize),
    Done,
}

/// Build the root into `dest` and every other version into its directory.
///
/// A failing non-root version is removed and the whole build starts over so
/// no page links to it. A failing root is fatal.
pub fn build_all(
    exported: &Path,
    dest: &Path,
    registry: &mut VersionRegistry,
    engine: &dyn BuildEngine,
) -> Result<()> {
    let mut state = BuildState::BuildingRoot;

    loop {
        state = match state {
            BuildState::BuildingRoot => {
                let root = registry.root().cloned().context("No root version selected")?;
                log!("build"; "Building root: {}", root.name);
                fs::create_dir_all(dest).with_context(|| format!("Failed to create `{}`", dest.display()))?;
                engine
                    .run_build(&source_of(exported, &root), dest, registry, &root.id)
                    .context("Root version failed to build")?;
                BuildState::BuildingNonRoot(0)
            }
            BuildState::BuildingNonRoot(index) => {
                let next = registry.entries().iter().filter(|e| !registry.is_root(e)).nth(index).cloned();
                match next {
                    None => BuildState::Done,
                    Some(entry) => {
                        log!("build"; "Building ref: {}", entry.name);
                        let target = dest.join(entry.dir());
                        let view = registry.sub_view(1);
                        match engine.run_build(&source_of(exported, &entry), &target, &view, &entry.id) {
                            Ok(()) => BuildState::BuildingNonRoot(index + 1),
                            Err(e) => {
                                log!("warn"; "{e}");
                                log!("warn"; "Skipping. Will not be building {}. Rebuilding everything.", entry.name);
                                registry.remove(entry.id.as_str())?;
                                BuildState::BuildingRoot
                            }
                        }
                    }
                }
            }
            BuildState::Done => return Ok(()),
        };
    }
}

/// `<rel_source>/<config_file>` for every source, relative to the repo root.
pub fn candidate_paths(rel_source: &[String], config_file: &str) -> Vec<String> {
    rel_source
        .iter()
        .map(|source| {
            let source = source.trim_matches('/');
            if source.is_empty() || source == "." {
                config_file.to_owned()
            } else {
                format!("{source}/{config_file}")
            }
        })
        .collect()
}

/// Full build of every version with docs into `destination`.
///
/// Returns the registry of versions that were built.
pub fn build(
    git_root: &Path,
    destination: &Path,
    rel_source: &[String],
    config: &Config,
    engine: &dyn BuildEngine,
) -> Result<VersionRegistry> {
    let candidates = candidate_paths(rel_source, &config.build.config_file);
    let remotes = gather_git_info(git_root, &candidates, &config.branch_patterns()?, &config.tag_patterns()?)?;
    if remotes.is_empty() {
        bail!("No docs found in any remote branch/tag. Nothing to do.");
    }

    let versions = &config.versions;
    let mut registry = VersionRegistry::build(
        remotes,
        &versions.sort,
        versions.priority,
        versions.invert,
        &config.build.primary_page,
    );

    let root_id = choose_root_ref(&registry, versions)?;
    registry.set_root(root_id.as_str())?;
    log!("build"; "Root ref: {}", root_id);

    let exported = export_all(git_root, &registry)?;
    discover_urls(exported.path(), &mut registry, engine)?;
    build_all(exported.path(), destination, &mut registry, engine)?;

    log!("build"; "Built: {}", registry.names());
    Ok(registry)
}

// ============================================================================
// Tests
// ============================================================================
