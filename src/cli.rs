//! Command-line interface definitions.
//!
//! Global options go before the subcommand name (e.g. `versiondocs -C build ...`).
//! Arguments after `--` are passed to the build engine for every version.

use crate::versions::{Priority, sort::SortPolicy};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Build versioned documentation for every branch and tag pushed to origin
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Make this the current working directory before running
    #[arg(short = 'c', long)]
    pub chdir: Option<PathBuf>,

    /// Disable colors in the terminal output
    #[arg(short = 'C', long)]
    pub no_colors: bool,

    /// Path to a directory in the local repo. Default is the working directory
    #[arg(short = 'g', long)]
    pub git_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Config file to read instead of ./versiondocs.toml
    #[arg(short = 'L', long, conflicts_with = "no_local_conf")]
    pub local_conf: Option<PathBuf>,

    /// Do not read a local config file
    #[arg(short = 'N', long)]
    pub no_local_conf: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by `build` and `push`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct VersionArgs {
    /// Invert/reverse order of versions
    #[arg(short, long)]
    pub invert: bool,

    /// Group these kinds of versions at the top
    #[arg(short, long, value_enum)]
    pub priority: Option<Priority>,

    /// The branch/tag at the root of the destination. Others are in subdirs
    #[arg(short, long)]
    pub root_ref: Option<String>,

    /// Sort versions by one or more (comma separated): semver, alpha, chrono
    #[arg(short = 'S', long, value_enum, value_delimiter = ',', ignore_case = true)]
    pub sort: Option<Vec<SortPolicy>>,

    /// Override root-ref to be the tag with the highest version number
    #[arg(short = 't', long)]
    pub greatest_tag: bool,

    /// Override root-ref to be the most recent committed tag
    #[arg(short = 'T', long)]
    pub recent_tag: bool,

    /// Only include branches matching this regex. Repeatable
    #[arg(short = 'w', long = "whitelist-branches")]
    pub whitelist_branches: Vec<String>,

    /// Only include tags matching this regex. Repeatable
    #[arg(short = 'W', long = "whitelist-tags")]
    pub whitelist_tags: Vec<String>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch branches/tags and build all locally into DESTINATION
    Build {
        #[command(flatten)]
        versions: VersionArgs,

        /// Local directory that will hold the docs of all versions
        destination: PathBuf,

        /// Docs directory relative to the git root. Give several if it moved between refs
        #[arg(required = true)]
        rel_source: Vec<String>,

        /// Extra arguments for the build engine
        #[arg(last = true)]
        overflow: Vec<String>,
    },

    /// Build into a clone of DEST_BRANCH and push it to origin
    Push {
        #[command(flatten)]
        versions: VersionArgs,

        /// Keep these paths (relative to REL_DEST) when clearing REL_DEST. Repeatable
        #[arg(short = 'e', long)]
        grm_exclude: Vec<String>,

        /// Branch to commit the built docs to
        dest_branch: String,

        /// Directory in DEST_BRANCH that holds the docs of all versions
        rel_dest: String,

        /// Docs directory relative to the git root. Give several if it moved between refs
        #[arg(required = true)]
        rel_source: Vec<String>,

        /// Extra arguments for the build engine
        #[arg(last = true)]
        overflow: Vec<String>,
    },
}

impl Cli {
    pub fn version_args(&self) -> &VersionArgs {
        match &self.command {
            Commands::Build { versions, .. } | Commands::Push { versions, .. } => versions,
        }
    }

    pub fn rel_source(&self) -> &[String] {
        match &self.command {
            Commands::Build { rel_source, .. } | Commands::Push { rel_source, .. } => rel_source,
        }
    }

    pub fn overflow(&self) -> &[String] {
        match &self.command {
            Commands::Build { overflow, .. } | Commands::Push { overflow, .. } => overflow,
        }
    }

    pub fn grm_exclude(&self) -> &[String] {
        match &self.command {
            Commands::Push { grm_exclude, .. } => grm_exclude,
            Commands::Build { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("versiondocs").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_build_minimal() {
        let cli = parse(&["build", "docs/_build/html", "docs"]);
        let Commands::Build { destination, rel_source, overflow, versions } = &cli.command else {
            panic!("expected build");
        };
        assert_eq!(destination, &PathBuf::from("docs/_build/html"));
        assert_eq!(rel_source, &["docs"]);
        assert!(overflow.is_empty());
        assert!(!versions.invert && versions.sort.is_none() && versions.root_ref.is_none());
    }

    #[test]
    fn test_build_options_and_overflow() {
        let cli = parse(&[
            "-C", "-v", "build", "-i", "-p", "tags", "-r", "dev", "-S", "semver,time", "-t", "-w", "^v", "-w",
            "master", "out", "docs", "doc", "--", "-D", "x=1",
        ]);
        assert!(cli.no_colors && cli.verbose);
        let args = cli.version_args();
        assert!(args.invert && args.greatest_tag && !args.recent_tag);
        assert_eq!(args.priority, Some(Priority::Tags));
        assert_eq!(args.root_ref.as_deref(), Some("dev"));
        assert_eq!(args.sort, Some(vec![SortPolicy::Semver, SortPolicy::Chrono]));
        assert_eq!(args.whitelist_branches, ["^v", "master"]);
        assert_eq!(cli.rel_source(), ["docs", "doc"]);
        assert_eq!(cli.overflow(), ["-D", "x=1"]);
    }

    #[test]
    fn test_push() {
        let cli = parse(&["push", "-e", "README.md", "-e", ".nojekyll", "gh-pages", ".", "docs"]);
        let Commands::Push { dest_branch, rel_dest, .. } = &cli.command else {
            panic!("expected push");
        };
        assert_eq!(dest_branch, "gh-pages");
        assert_eq!(rel_dest, ".");
        assert_eq!(cli.grm_exclude(), ["README.md", ".nojekyll"]);
    }

    #[test]
    fn test_rejects_unknown_sort() {
        let result = Cli::try_parse_from(["versiondocs", "build", "-S", "bogus", "out", "docs"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_sort_short_flag_is_uppercase() {
        let cli = parse(&["build", "-S", "alpha", "out", "docs"]);
        assert_eq!(cli.version_args().sort, Some(vec![SortPolicy::Alpha]));
        assert!(Cli::try_parse_from(["versiondocs", "build", "-s", "alpha", "out", "docs"]).is_err());
    }

    #[test]
    fn test_requires_source() {
        assert!(Cli::try_parse_from(["versiondocs", "build", "out"]).is_err());
    }

    #[test]
    fn test_local_conf_conflict() {
        let result = Cli::try_parse_from(["versiondocs", "-L", "a.toml", "-N", "build", "out", "docs"]);
        assert!(result.is_err());
    }
}
