//! Run configuration.
//!
//! Values come from three layers, later ones winning:
//! built-in defaults, the local `versiondocs.toml`, then command-line flags.
//! The result is resolved once at startup and never changes afterwards.

use crate::{
    cli::{Cli, VersionArgs},
    log,
    versions::{Priority, sort::SortPolicy},
};
use anyhow::{Context, Result, bail};
use educe::Educe;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Local config file read when `--local-conf` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "versiondocs.toml";

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Default values for serde deserialization
pub mod config_defaults {
    pub mod versions {
        use crate::versions::sort::SortPolicy;

        pub fn root_ref() -> String {
            "master".into()
        }
        pub fn sort() -> Vec<SortPolicy> {
            Vec::new()
        }
    }

    pub mod build {
        pub fn config_file() -> String {
            "conf.py".into()
        }
        pub fn command() -> Vec<String> {
            vec!["sphinx-build".into()]
        }
        pub fn primary_page() -> String {
            crate::versions::DEFAULT_PRIMARY_PAGE.into()
        }
    }

    pub mod push {
        pub fn retries() -> u32 {
            3
        }
        pub fn sleep_secs() -> u64 {
            3
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// `[versions]` section: which refs are built and in what order
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct VersionsConfig {
    /// Version placed at the destination root
    #[serde(default = "config_defaults::versions::root_ref")]
    #[educe(Default = config_defaults::versions::root_ref())]
    pub root_ref: String,

    /// Sort policies, applied left to right
    #[serde(default = "config_defaults::versions::sort")]
    #[educe(Default = config_defaults::versions::sort())]
    pub sort: Vec<SortPolicy>,

    /// Group branches or tags at the top
    pub priority: Option<Priority>,

    /// Reverse the final order
    pub invert: bool,

    /// Root is the tag with the greatest version number
    pub greatest_tag: bool,

    /// Root is the most recently committed tag
    pub recent_tag: bool,

    /// Branch name patterns. Empty keeps every branch
    pub whitelist_branches: Vec<String>,

    /// Tag name patterns. Empty keeps every tag
    pub whitelist_tags: Vec<String>,
}

/// `[build]` section: how each version is built
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// File whose presence marks a commit as having docs
    #[serde(default = "config_defaults::build::config_file")]
    #[educe(Default = config_defaults::build::config_file())]
    pub config_file: String,

    /// Engine command. Source and target directories are appended
    #[serde(default = "config_defaults::build::command")]
    #[educe(Default = config_defaults::build::command())]
    pub command: Vec<String>,

    /// Primary page when the engine does not report one
    #[serde(default = "config_defaults::build::primary_page")]
    #[educe(Default = config_defaults::build::primary_page())]
    pub primary_page: String,

    /// Run the engine in a pseudo-terminal to keep its colored output
    pub pty: bool,
}

/// `[push]` section: publishing to a branch
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    /// Paths under the destination kept when it is cleared
    pub exclude: Vec<String>,

    /// Attempts before giving up
    #[serde(default = "config_defaults::push::retries")]
    #[educe(Default = config_defaults::push::retries())]
    pub retries: u32,

    /// Pause between attempts
    #[serde(default = "config_defaults::push::sleep_secs")]
    #[educe(Default = config_defaults::push::sleep_secs())]
    pub sleep_secs: u64,
}

// ============================================================================
// Root
// ============================================================================

/// Resolved configuration of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub versions: VersionsConfig,
    pub build: BuildConfig,
    pub push: PushConfig,

    /// File the values were read from, if any
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Load configuration from file path
    pub fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        let mut config = Self::from_str(&content)
            .with_context(|| format!("Invalid config file `{}`", path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolve defaults, the local config file and CLI flags, then validate.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match Self::local_conf_path(cli) {
            Some(path) => {
                log!("config"; "reading {}", path.display());
                Self::from_path(&path)?
            }
            None => Self::default(),
        };

        config.update_with_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Explicit `--local-conf`, else `versiondocs.toml` when it exists.
    fn local_conf_path(cli: &Cli) -> Option<PathBuf> {
        if cli.no_local_conf {
            return None;
        }
        if let Some(path) = &cli.local_conf {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            return Some(PathBuf::from(expanded));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.is_file().then_some(default)
    }

    /// Apply command-line flags on top of file values.
    pub fn update_with_cli(&mut self, cli: &Cli) {
        self.update_versions(cli.version_args());
        if !cli.grm_exclude().is_empty() {
            self.push.exclude = cli.grm_exclude().to_vec();
        }
    }

    fn update_versions(&mut self, args: &VersionArgs) {
        let versions = &mut self.versions;

        Self::update_option(&mut versions.root_ref, args.root_ref.as_ref());
        Self::update_option(&mut versions.sort, args.sort.as_ref());
        if args.priority.is_some() {
            versions.priority = args.priority;
        }

        versions.invert |= args.invert;
        versions.greatest_tag |= args.greatest_tag;
        versions.recent_tag |= args.recent_tag;

        if !args.whitelist_branches.is_empty() {
            versions.whitelist_branches = args.whitelist_branches.clone();
        }
        if !args.whitelist_tags.is_empty() {
            versions.whitelist_tags = args.whitelist_tags.clone();
        }
    }

    /// Update config option if CLI value is provided
    fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
        if let Some(option) = cli_option {
            *config_option = option.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Self::check_command_installed("[build.command]", &self.build.command)?;

        if self.build.config_file.trim().is_empty() {
            bail!(ConfigError::Validation("[build.config_file] must not be empty".into()));
        }

        if self.build.primary_page.trim().is_empty() {
            bail!(ConfigError::Validation("[build.primary_page] must not be empty".into()));
        }

        if self.push.retries == 0 {
            bail!(ConfigError::Validation("[push.retries] must be at least 1".into()));
        }

        if self.versions.greatest_tag && self.versions.recent_tag {
            bail!(ConfigError::Validation(
                "[versions.greatest_tag] and [versions.recent_tag] are mutually exclusive".into()
            ));
        }

        Self::compile_patterns("[versions.whitelist_branches]", &self.versions.whitelist_branches)?;
        Self::compile_patterns("[versions.whitelist_tags]", &self.versions.whitelist_tags)?;

        Ok(())
    }

    /// Compiled branch whitelist.
    pub fn branch_patterns(&self) -> Result<Vec<Regex>> {
        Self::compile_patterns("[versions.whitelist_branches]", &self.versions.whitelist_branches)
    }

    /// Compiled tag whitelist.
    pub fn tag_patterns(&self) -> Result<Vec<Regex>> {
        Self::compile_patterns("[versions.whitelist_tags]", &self.versions.whitelist_tags)
    }

    fn compile_patterns(field: &str, patterns: &[String]) -> Result<Vec<Regex>> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    anyhow::Error::from(ConfigError::Validation(format!(
                        "{field} has invalid pattern `{p}`: {e}"
                    )))
                })
            })
            .collect()
    }

    /// Check if a command is installed and available
    fn check_command_installed(field: &str, command: &[String]) -> Result<()> {
        if command.is_empty() {
            bail!(ConfigError::Validation(format!(
                "{field} must have at least one element"
            )));
        }

        let cmd = &command[0];
        which::which(cmd)
            .with_context(|| format!("`{cmd}` not found. Please install it first."))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::DEFAULT_PRIMARY_PAGE;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.versions.root_ref, "master");
        assert!(config.versions.sort.is_empty());
        assert!(config.versions.priority.is_none());
        assert_eq!(config.build.config_file, "conf.py");
        assert_eq!(config.build.command, ["sphinx-build"]);
        assert_eq!(config.build.primary_page, DEFAULT_PRIMARY_PAGE);
        assert_eq!(config.push.retries, 3);
        assert_eq!(config.push.sleep_secs, 3);
    }

    #[test]
    fn test_empty_file_matches_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.versions.root_ref, "master");
        assert_eq!(config.build.command, ["sphinx-build"]);
        assert_eq!(config.push.retries, 3);
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::from_str(
            r#"
            [versions]
            root_ref = "main"
            sort = ["semver", "time"]
            priority = "tags"
            whitelist_tags = ["^v\\d"]

            [build]
            command = ["python", "-m", "sphinx"]
            primary_page = "index"

            [push]
            exclude = [".nojekyll"]
            retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.versions.root_ref, "main");
        assert_eq!(config.versions.sort, [SortPolicy::Semver, SortPolicy::Chrono]);
        assert_eq!(config.versions.priority, Some(Priority::Tags));
        assert_eq!(config.versions.whitelist_tags, ["^v\\d"]);
        assert_eq!(config.build.command, ["python", "-m", "sphinx"]);
        assert_eq!(config.build.primary_page, "index");
        assert_eq!(config.build.config_file, "conf.py");
        assert_eq!(config.push.exclude, [".nojekyll"]);
        assert_eq!(config.push.retries, 5);
        assert_eq!(config.push.sleep_secs, 3);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(Config::from_str("[versions]\nroot = \"main\"").is_err());
        assert!(Config::from_str("[deploy]\nbranch = \"gh-pages\"").is_err());
    }

    #[test]
    fn test_unknown_sort_rejected() {
        assert!(Config::from_str("[versions]\nsort = [\"bogus\"]").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::from_str(
            r#"
            [versions]
            root_ref = "main"
            sort = ["alpha"]
            whitelist_branches = ["^main$"]
            "#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "versiondocs", "push", "-r", "dev", "-S", "semver", "-i", "-e", "CNAME", "gh-pages", ".", "docs",
        ])
        .unwrap();

        config.update_with_cli(&cli);
        assert_eq!(config.versions.root_ref, "dev");
        assert_eq!(config.versions.sort, [SortPolicy::Semver]);
        assert!(config.versions.invert);
        assert_eq!(config.versions.whitelist_branches, ["^main$"]);
        assert_eq!(config.push.exclude, ["CNAME"]);
    }

    #[test]
    fn test_cli_without_flags_keeps_file() {
        let mut config = Config::from_str("[versions]\nroot_ref = \"main\"\ninvert = true").unwrap();
        let cli = Cli::try_parse_from(["versiondocs", "build", "out", "docs"]).unwrap();
        config.update_with_cli(&cli);
        assert_eq!(config.versions.root_ref, "main");
        assert!(config.versions.invert);
    }

    #[test]
    fn test_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versiondocs.toml");
        fs::write(&path, "[push]\nsleep_secs = 0\n").unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.push.sleep_secs, 0);
        assert_eq!(config.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_from_path_missing() {
        let err = Config::from_path(Path::new("/nonexistent/versiondocs.toml")).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Io(..))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.build.command = vec!["sh".into()];
        assert!(config.validate().is_ok());

        config.push.retries = 0;
        assert!(config.validate().is_err());
        config.push.retries = 1;

        config.versions.whitelist_tags = vec!["(".into()];
        assert!(config.validate().is_err());
        config.versions.whitelist_tags.clear();

        config.versions.greatest_tag = true;
        config.versions.recent_tag = true;
        assert!(config.validate().is_err());
        config.versions.recent_tag = false;

        config.build.command.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_missing_command() {
        let mut config = Config::default();
        config.build.command = vec!["versiondocs-no-such-engine".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patterns() {
        let mut config = Config::default();
        config.versions.whitelist_branches = vec!["^master$".into(), "release".into()];
        let patterns = config.branch_patterns().unwrap();
        assert_eq!(patterns.len(), 2);
        assert!(patterns[1].is_match("old-release-1"));
        assert!(config.tag_patterns().unwrap().is_empty());
    }
}
