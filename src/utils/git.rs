//! Git operations.
//!
//! Read-only access to the local object database goes through `gix`.
//! Anything that talks to `origin` or changes a work tree shells out to `git`.

use crate::{
    debug, git, log,
    utils::exec::{Echo, exec},
    versions::{RemoteRef, VersionKind},
};
use gix::{ObjectId, Repository, bstr::ByteSlice, objs::tree::EntryMode};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use walkdir::WalkDir;

/// A git command or object lookup failed.
///
/// The command output is kept as the error source so it shows up in the
/// `{:#}` chain next to the message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GitError {
    pub message: String,
    #[source]
    pub output: GitOutput,
}

/// Output of the failing git command, or the underlying error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct GitOutput(pub String);

impl GitError {
    pub fn new(message: impl Into<String>, output: impl ToString) -> Self {
        Self {
            message: message.into(),
            output: GitOutput(output.to_string().trim_end().to_owned()),
        }
    }
}

type Result<T> = std::result::Result<T, GitError>;

/// Changes limited to these never warrant a commit on their own.
const INSIGNIFICANT_DIR: &str = ".doctrees";
const INSIGNIFICANT_FILE: &str = "searchindex.js";

/// CI variables copied into the commit message body when set.
const COMMIT_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITHUB_REF",
    "GITHUB_RUN_ID",
    "GITHUB_SHA",
    "TRAVIS_BRANCH",
    "TRAVIS_BUILD_ID",
];

// ============================================================================
// Repository
// ============================================================================

/// Work-tree root of the repository containing `dir`.
pub fn get_root(dir: &Path) -> Result<PathBuf> {
    let repo = gix::discover(dir)
        .map_err(|e| GitError::new(format!("Not a git repository: {}", dir.display()), e))?;
    repo_root(&repo).map(Path::to_path_buf)
}

fn open_repo(root: &Path) -> Result<Repository> {
    gix::open(root).map_err(|e| GitError::new("Failed to open repository", e))
}

fn repo_root(repo: &Repository) -> Result<&Path> {
    repo.path()
        .parent()
        .ok_or_else(|| GitError::new("Invalid repository path", repo.path().display()))
}

// ============================================================================
// Remote refs
// ============================================================================

/// Remote branch or tag as listed by `git ls-remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRef {
    pub sha: String,
    pub name: String,
    pub kind: VersionKind,
}

/// All branches and tags on `origin`.
pub fn list_remote(root: &Path) -> Result<Vec<ListedRef>> {
    let output = git!(root; "ls-remote", "--heads", "--tags", "origin")
        .map_err(|e| GitError::new("Git failed to list remote refs.", e))?;
    Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ls-remote` output. Peeled `^{}` lines replace the sha of their tag.
fn parse_ls_remote(stdout: &str) -> Vec<ListedRef> {
    let mut refs: Vec<ListedRef> = Vec::new();
    for line in stdout.lines() {
        let Some((sha, full)) = line.split_once('\t') else {
            continue;
        };
        let (kind, name) = if let Some(name) = full.strip_prefix("refs/heads/") {
            (VersionKind::Branch, name)
        } else if let Some(name) = full.strip_prefix("refs/tags/") {
            (VersionKind::Tag, name)
        } else {
            continue;
        };

        if let Some(tag) = name.strip_suffix("^{}") {
            if let Some(existing) = refs
                .iter_mut()
                .find(|r| r.kind == VersionKind::Tag && r.name == tag)
            {
                existing.sha = sha.trim().to_owned();
            }
            continue;
        }

        refs.push(ListedRef {
            sha: sha.trim().to_owned(),
            name: name.to_owned(),
            kind,
        });
    }
    refs
}

/// Fetch every listed ref from `origin` and check all commits arrived.
pub fn fetch_commits(root: &Path, refs: &[ListedRef]) -> Result<()> {
    let mut argv: Vec<OsString> = vec!["git".into(), "fetch".into(), "origin".into()];
    argv.extend(refs.iter().map(|r| format!("refs/{}/{}", r.kind.namespace(), r.name).into()));

    exec(Some(root), &argv, &[], Echo::Silent, false)
        .map_err(|e| GitError::new("Failed to fetch remote refs.", e))?;

    let repo = open_repo(root)?;
    for r in refs {
        let id = parse_sha(&r.sha)?;
        if !repo.has_object(id) {
            return Err(GitError::new(
                format!("Failed to fetch {} {}", r.kind, r.name),
                &r.sha,
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Commits
// ============================================================================

fn parse_sha(sha: &str) -> Result<ObjectId> {
    ObjectId::from_hex(sha.as_bytes()).map_err(|e| GitError::new(format!("Invalid sha {sha}"), e))
}

/// Commit time and first matching candidate path for every sha that has one.
///
/// Fails if any commit is missing locally; the caller fetches and retries.
pub fn filter_and_date<'a>(
    root: &Path,
    candidates: &[String],
    shas: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, (i64, String)>> {
    let repo = open_repo(root)?;
    let mut found = BTreeMap::new();

    for sha in shas {
        if found.contains_key(sha) {
            continue;
        }
        let id = parse_sha(sha)?;
        let commit = repo
            .find_commit(id)
            .map_err(|e| GitError::new(format!("Commit {sha} not found locally"), e))?;
        let time = commit
            .time()
            .map_err(|e| GitError::new(format!("Unreadable commit {sha}"), e))?
            .seconds;
        let tree = commit
            .tree_id()
            .map_err(|e| GitError::new(format!("Unreadable commit {sha}"), e))?
            .detach();

        for candidate in candidates {
            if let Some((mode, _)) = lookup_path(&repo, tree, candidate)?
                && !mode.is_tree()
            {
                found.insert(sha.to_owned(), (time, candidate.clone()));
                break;
            }
        }
    }

    Ok(found)
}

/// Entry at `path` inside `tree`, if any.
fn lookup_path(repo: &Repository, tree: ObjectId, path: &str) -> Result<Option<(EntryMode, ObjectId)>> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let mut current = tree;

    for (i, part) in parts.iter().enumerate() {
        let tree = repo
            .find_tree(current)
            .map_err(|e| GitError::new(format!("Missing tree {current}"), e))?;
        let decoded = tree
            .decode()
            .map_err(|e| GitError::new(format!("Corrupt tree {current}"), e))?;
        let Some(entry) = decoded.entries.iter().find(|e| e.filename == part.as_bytes()) else {
            return Ok(None);
        };
        if i + 1 == parts.len() {
            return Ok(Some((entry.mode, entry.oid.to_owned())));
        }
        if !entry.mode.is_tree() {
            return Ok(None);
        }
        current = entry.oid.to_owned();
    }

    Ok(None)
}

// ============================================================================
// Export
// ============================================================================

/// Write the full tree of `sha` into `target`.
///
/// Existing files are overwritten, never deleted. Symlinks are replaced by a
/// copy of what they point to when that exists in the export; others are
/// skipped.
pub fn export(root: &Path, sha: &str, target: &Path) -> Result<()> {
    let repo = open_repo(root)?;
    let id = parse_sha(sha)?;
    let commit = repo
        .find_commit(id)
        .map_err(|e| GitError::new(format!("Commit {sha} not found locally"), e))?;
    let tree = commit
        .tree_id()
        .map_err(|e| GitError::new(format!("Unreadable commit {sha}"), e))?
        .detach();

    fs::create_dir_all(target).map_err(|e| GitError::new("Failed to create export dir", e))?;
    let mut links = Vec::new();
    write_tree(&repo, tree, target, &mut links)?;
    materialize_links(target, links);
    Ok(())
}

fn write_tree(repo: &Repository, tree: ObjectId, dir: &Path, links: &mut Vec<(PathBuf, PathBuf)>) -> Result<()> {
    let tree = repo
        .find_tree(tree)
        .map_err(|e| GitError::new(format!("Missing tree {tree}"), e))?;
    let decoded = tree
        .decode()
        .map_err(|e| GitError::new("Corrupt tree", e))?;
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |e: std::io::Error| GitError::new(format!("Failed to write {path}"), e)
    };

    for entry in &decoded.entries {
        let path = dir.join(entry.filename.to_str_lossy().as_ref());
        let oid = entry.oid.to_owned();

        if entry.mode.is_tree() {
            fs::create_dir_all(&path).map_err(io_err(&path))?;
            write_tree(repo, oid, &path, links)?;
        } else if entry.mode.is_commit() {
            // Submodules are not part of the export.
            continue;
        } else {
            let object = repo
                .find_object(oid)
                .map_err(|e| GitError::new(format!("Missing blob {oid}"), e))?;
            if entry.mode.is_link() {
                let link = PathBuf::from(object.data.to_str_lossy().as_ref());
                links.push((path, link));
            } else {
                fs::write(&path, &object.data).map_err(io_err(&path))?;
            }
        }
    }
    Ok(())
}

/// Copy each link target over the link path. Repeats while progress is made
/// so links to links resolve.
fn materialize_links(root: &Path, mut links: Vec<(PathBuf, PathBuf)>) {
    loop {
        let before = links.len();
        links.retain(|(path, link)| {
            let Some(resolved) = resolve_link(root, path, link) else {
                return true;
            };
            match copy_path(&resolved, path) {
                Ok(()) => false,
                Err(e) => {
                    debug!("git"; "cannot copy {} -> {}: {e}", resolved.display(), path.display());
                    true
                }
            }
        });
        if links.is_empty() || links.len() == before {
            break;
        }
    }

    for (path, link) in links {
        debug!("git"; "skipping broken symlink {} -> {}", path.display(), link.display());
    }
}

/// Target of a link relative to its own directory, if it exists inside `root`.
fn resolve_link(root: &Path, path: &Path, link: &Path) -> Option<PathBuf> {
    if link.is_absolute() {
        return None;
    }
    let mut resolved = path.parent()?.to_path_buf();
    for component in link.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => resolved.push(part),
            _ => {}
        }
    }
    (resolved.starts_with(root) && resolved.exists()).then_some(resolved)
}

fn copy_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_file() {
        fs::copy(from, to)?;
        return Ok(());
    }
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).map_err(std::io::Error::other)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

// ============================================================================
// Clone / commit / push
// ============================================================================

/// Clone `branch` of `origin` into `target`.
///
/// Remotes of the local repository are carried over. When `rel_dest` is set,
/// everything under it is `git rm`ed except the `exclude` paths.
pub fn clone(root: &Path, target: &Path, branch: &str, rel_dest: &str, exclude: &[String]) -> Result<()> {
    let output = git!(root; "remote", "-v")
        .map_err(|e| GitError::new("Git failed to list remotes.", e))?;
    let remotes = parse_remotes(&String::from_utf8_lossy(&output.stdout));
    let Some(origin) = remotes.iter().find(|r| r.name == "origin") else {
        return Err(GitError::new("Git repo missing remote \"origin\".", "git remote -v"));
    };

    git!(root; "clone", "--branch", branch, &origin.fetch, target)
        .map_err(|e| GitError::new(format!("Failed to clone branch {branch}."), e))?;

    for remote in &remotes {
        if remote.name != "origin" {
            git!(target; "remote", "add", &remote.name, &remote.fetch)
                .map_err(|e| GitError::new("Failed to copy remotes.", e))?;
        }
        if remote.push != remote.fetch {
            git!(target; "remote", "set-url", "--push", &remote.name, &remote.push)
                .map_err(|e| GitError::new("Failed to copy remotes.", e))?;
        }
    }

    if rel_dest.is_empty() {
        return Ok(());
    }

    git!(target; "rm", "-r", "--quiet", "--ignore-unmatch", "--", rel_dest)
        .map_err(|e| GitError::new(format!("Failed to clear {rel_dest}."), e))?;

    for pattern in exclude {
        let path = Path::new(rel_dest).join(pattern);
        let restored = git!(target; "reset", "--quiet", "HEAD", "--", &path)
            .and_then(|_| git!(target; "checkout", "--", &path));
        if restored.is_err() {
            log!("warn"; "exclude path not found in {branch}: {}", path.display());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteUrls {
    name: String,
    fetch: String,
    push: String,
}

/// Parse `git remote -v`.
fn parse_remotes(stdout: &str) -> Vec<RemoteUrls> {
    let mut remotes: Vec<RemoteUrls> = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(url), Some(direction)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let index = match remotes.iter().position(|r| r.name == name) {
            Some(i) => i,
            None => {
                remotes.push(RemoteUrls {
                    name: name.to_owned(),
                    fetch: url.to_owned(),
                    push: url.to_owned(),
                });
                remotes.len() - 1
            }
        };
        match direction {
            "(fetch)" => remotes[index].fetch = url.to_owned(),
            "(push)" => remotes[index].push = url.to_owned(),
            _ => {}
        }
    }
    remotes
}

/// Whether a `git status --porcelain` line is worth committing.
fn is_significant(line: &str) -> bool {
    let (status, path) = (line.get(..2).unwrap_or(""), line.get(3..).unwrap_or(""));
    if !status.starts_with('M') {
        return true;
    }
    let mut parts = path.rsplit('/');
    let file = parts.next().unwrap_or("");
    !(file == INSIGNIFICANT_FILE || path.split('/').any(|p| p == INSIGNIFICANT_DIR))
}

fn commit_message(versions: &[&str]) -> String {
    let mut message = String::from("AUTO: versiondocs\n\n");
    message.push_str(&format!("VERSIONS: {}\n", versions.join(" ")));
    for var in COMMIT_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            message.push_str(&format!("{var}: {value}\n"));
        }
    }
    message
}

/// Stage, commit and push the work tree at `root`.
///
/// Returns `Ok(false)` when the push lost a race with another publisher.
pub fn commit_and_push(root: &Path, versions: &[&str]) -> Result<bool> {
    git!(root; "add", "--all", ".")
        .map_err(|e| GitError::new("Failed to stage changes.", e))?;

    let status = git!(root; "status", "--porcelain")
        .map_err(|e| GitError::new("Failed to read status.", e))?;
    let status = String::from_utf8_lossy(&status.stdout);
    let lines: Vec<&str> = status.lines().filter(|l| !l.trim().is_empty()).collect();

    if lines.is_empty() {
        log!("push"; "No changes to commit.");
        return Ok(true);
    }
    if !lines.iter().any(|l| is_significant(l)) {
        log!("push"; "No significant changes to commit.");
        return Ok(true);
    }

    let branch = git!(root; "rev-parse", "--abbrev-ref", "HEAD")
        .map_err(|e| GitError::new("Failed to read current branch.", e))?;
    let branch = String::from_utf8_lossy(&branch.stdout).trim().to_owned();

    git!(root; "commit", "--quiet", "-m", commit_message(versions))
        .map_err(|e| GitError::new("Failed to commit locally.", e))?;

    match git!(root; "push", "origin", &branch) {
        Ok(_) => {
            log!("push"; "pushed {branch}");
            Ok(true)
        }
        Err(e) if e.to_string().contains("rejected") => Ok(false),
        Err(e) => Err(GitError::new("Failed to push to remote.", e)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_error_keeps_git_output() {
        let err = GitError::new(
            "Git failed to list remote refs.",
            "fatal: 'origin' does not appear to be a git repository\n",
        );
        assert_eq!(err.to_string(), "Git failed to list remote refs.");

        let chained = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(
            chained,
            "Git failed to list remote refs.: fatal: 'origin' does not appear to be a git repository"
        );
    }

    #[test]
    fn test_parse_ls_remote() {
        let stdout = "\
aaaa\trefs/heads/feature
bbbb\trefs/heads/master
cccc\trefs/tags/annotated_tag
bbbb\trefs/tags/annotated_tag^{}
bbbb\trefs/tags/light_tag
dddd\trefs/pull/1/head
";
        let refs = parse_ls_remote(stdout);
        let flat: Vec<(&str, &str, VersionKind)> =
            refs.iter().map(|r| (r.sha.as_str(), r.name.as_str(), r.kind)).collect();
        assert_eq!(
            flat,
            [
                ("aaaa", "feature", VersionKind::Branch),
                ("bbbb", "master", VersionKind::Branch),
                ("bbbb", "annotated_tag", VersionKind::Tag),
                ("bbbb", "light_tag", VersionKind::Tag),
            ]
        );
    }

    #[test]
    fn test_parse_ls_remote_empty() {
        assert!(parse_ls_remote("").is_empty());
    }

    #[test]
    fn test_parse_remotes() {
        let stdout = "\
origin\thttps://example.com/a.git (fetch)
origin\tgit@example.com:a.git (push)
upstream\thttps://example.com/b.git (fetch)
upstream\thttps://example.com/b.git (push)
";
        let remotes = parse_remotes(stdout);
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[0].fetch, "https://example.com/a.git");
        assert_eq!(remotes[0].push, "git@example.com:a.git");
        assert_eq!(remotes[1].name, "upstream");
    }

    #[test]
    fn test_is_significant() {
        assert!(is_significant("A  .doctrees/file.bin"));
        assert!(is_significant("M  README"));
        assert!(!is_significant("M  .doctrees/file.bin"));
        assert!(!is_significant("M  sub/.doctrees/env.pickle"));
        assert!(!is_significant("M  searchindex.js"));
        assert!(!is_significant("M  sub/searchindex.js"));
        assert!(is_significant("D  searchindex.js"));
    }

    #[test]
    fn test_commit_message_lists_versions() {
        let message = commit_message(&["master", "v1.0"]);
        assert!(message.starts_with("AUTO: versiondocs\n\n"));
        assert!(message.contains("VERSIONS: master v1.0\n"));
    }

    #[test]
    fn test_resolve_link_stays_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("README"), "x").unwrap();

        let link = root.join("docs/README");
        assert_eq!(
            resolve_link(root, &link, Path::new("../README")),
            Some(root.join("README"))
        );
        assert_eq!(resolve_link(root, &link, Path::new("../missing")), None);
        assert_eq!(resolve_link(root, &link, Path::new("/etc/passwd")), None);
        assert_eq!(resolve_link(root, &link, Path::new("../../../outside")), None);
    }

    // Tests below need the `git` binary and are skipped without it.

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_owned()
    }

    fn with_repo<F: FnOnce(&Path)>(f: F) {
        if which::which("git").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        git(root, &["init", "--quiet"]);
        fs::create_dir_all(root.join("docs/sub")).unwrap();
        fs::write(root.join("docs/conf.py"), "master_doc = 'index'\n").unwrap();
        fs::write(root.join("docs/sub/page.rst"), "page\n").unwrap();
        fs::write(root.join("README"), "readme\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "--quiet", "-m", "init"]);
        f(root);
    }

    #[test]
    fn test_get_root_from_subdir() {
        with_repo(|root| {
            let found = get_root(&root.join("docs/sub")).unwrap();
            assert_eq!(found.canonicalize().unwrap(), root.canonicalize().unwrap());
        });
    }

    #[test]
    fn test_get_root_outside_repo() {
        let dir = TempDir::new().unwrap();
        // A temp dir may still sit inside some repository; only check the error path when it does not.
        if gix::discover(dir.path()).is_err() {
            assert!(get_root(dir.path()).is_err());
        }
    }

    #[test]
    fn test_filter_and_date() {
        with_repo(|root| {
            let sha = git(root, &["rev-parse", "HEAD"]);
            let time: i64 = git(root, &["log", "-1", "--format=%ct"]).parse().unwrap();
            let candidates = vec!["doc/conf.py".to_owned(), "docs/conf.py".to_owned()];

            let found = filter_and_date(root, &candidates, [sha.as_str()]).unwrap();
            assert_eq!(found[&sha], (time, "docs/conf.py".to_owned()));

            let none = filter_and_date(root, &["nope/conf.py".to_owned()], [sha.as_str()]).unwrap();
            assert!(none.is_empty());

            let missing = "0".repeat(40);
            assert!(filter_and_date(root, &candidates, [missing.as_str()]).is_err());
        });
    }

    #[test]
    fn test_export_overwrites_without_deleting() {
        with_repo(|root| {
            let sha = git(root, &["rev-parse", "HEAD"]);
            let target = TempDir::new().unwrap();
            fs::write(target.path().join("README"), "old").unwrap();
            fs::write(target.path().join("keep.txt"), "keep").unwrap();

            export(root, &sha, target.path()).unwrap();
            assert_eq!(fs::read_to_string(target.path().join("README")).unwrap(), "readme\n");
            assert!(target.path().join("keep.txt").exists());
            assert!(target.path().join("docs/sub/page.rst").exists());
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_export_symlinks() {
        with_repo(|root| {
            std::os::unix::fs::symlink("../README", root.join("docs/README")).unwrap();
            std::os::unix::fs::symlink("missing", root.join("docs/broken")).unwrap();
            git(root, &["add", "."]);
            git(root, &["commit", "--quiet", "-m", "links"]);
            let sha = git(root, &["rev-parse", "HEAD"]);

            let target = TempDir::new().unwrap();
            export(root, &sha, target.path()).unwrap();
            let copied = target.path().join("docs/README");
            assert!(copied.is_file());
            assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
            assert!(!target.path().join("docs/broken").exists());
        });
    }
}
