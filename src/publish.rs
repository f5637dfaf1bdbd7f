//! Publishing built docs to a branch.
//!
//! Each attempt clones the destination branch into a temporary directory,
//! builds every version into it and pushes. A push rejected because the
//! branch moved meanwhile starts a new attempt from a fresh clone.

use crate::{config::Config, engine::BuildEngine, log, routines, utils::git};
use anyhow::{Context, Result, bail};
use std::{path::Path, thread, time::Duration};
use tempfile::TempDir;

/// Build all versions and push them to `dest_branch` under `rel_dest`.
pub fn push(
    git_root: &Path,
    dest_branch: &str,
    rel_dest: &str,
    rel_source: &[String],
    config: &Config,
    engine: &dyn BuildEngine,
) -> Result<()> {
    let retries = config.push.retries;
    let pause = Duration::from_secs(config.push.sleep_secs);

    with_retries(retries, pause, |attempt| {
        log!("push"; "attempt {attempt}/{retries}");
        let temp = TempDir::new().context("Failed to create temporary directory")?;

        log!("push"; "Cloning {dest_branch} into temporary directory...");
        git::clone(git_root, temp.path(), dest_branch, rel_dest, &config.push.exclude)?;

        log!("push"; "Building docs...");
        let target = temp.path().join(rel_dest);
        let registry = routines::build(git_root, &target, rel_source, config, engine)?;
        let versions: Vec<&str> = registry.entries().iter().map(|e| e.name.as_str()).collect();

        log!("push"; "Attempting to push to branch {dest_branch} on remote repository.");
        let pushed = git::commit_and_push(temp.path(), &versions)?;
        if pushed {
            log!("push"; "Successfully pushed to remote repository.");
        }
        Ok(pushed)
    })
}

/// Run `attempt` until it returns `Ok(true)`, at most `retries` times.
///
/// Errors end the loop at once. `Ok(false)` waits `pause` and tries again.
fn with_retries(retries: u32, pause: Duration, mut attempt: impl FnMut(u32) -> Result<bool>) -> Result<()> {
    for n in 1..=retries {
        if attempt(n)? {
            return Ok(());
        }
        if n < retries {
            log!("warn"; "Failed to push to remote repository. Retrying in {} seconds...", pause.as_secs());
            thread::sleep(pause);
        }
    }
    bail!("Ran out of retries, giving up.")
}
