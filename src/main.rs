//! versiondocs - Build documentation for every branch and tag of a git repository.

mod cli;
mod config;
mod engine;
mod publish;
mod routines;
mod utils;
mod versions;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use engine::CommandEngine;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::log::setup(cli.verbose, !cli.no_colors);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log!("error"; "{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(dir) = &cli.chdir {
        let dir = expand(dir);
        std::env::set_current_dir(&dir)
            .with_context(|| format!("Failed to change directory to `{}`", dir.display()))?;
    }

    let config = Config::load(cli)?;
    let git_root = find_git_root(cli.git_root.as_deref())?;
    debug!("git"; "working in {}", git_root.display());

    let engine = CommandEngine::new(
        config.build.command.clone(),
        cli.overflow().to_vec(),
        config.build.primary_page.clone(),
        config.build.pty,
    );

    match &cli.command {
        Commands::Build { destination, rel_source, .. } => {
            let destination = absolute(&expand(destination))?;
            routines::build(&git_root, &destination, rel_source, &config, &engine)?;
            log!("build"; "Success. Docs are in {}", destination.display());
            Ok(())
        }
        Commands::Push { dest_branch, rel_dest, rel_source, .. } => {
            publish::push(&git_root, dest_branch, rel_dest, rel_source, &config, &engine)
        }
    }
}

/// Work-tree root of the repository containing `dir` (default: working directory).
fn find_git_root(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => absolute(&expand(dir))?,
        None => std::env::current_dir().context("Failed to read the working directory")?,
    };
    Ok(utils::git::get_root(&dir)?)
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path `{}`", path.display()))
}
