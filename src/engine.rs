//! Documentation build engine.
//!
//! The engine is an external program run once per build or discovery, each
//! time in a fresh process. Everything it needs is handed over explicitly:
//!
//! - argv: `<command...> <source> <target> <overflow...>`
//! - `VERSIONDOCS_CURRENT_VERSION`: name of the version being built
//! - `VERSIONDOCS_CONTEXT`: path of a JSON [`RenderContext`] (builds only)
//! - `VERSIONDOCS_DISCOVER`: path where a plugin may write a JSON manifest
//!   `{primary_page, found_pages}` (discovery only)

use crate::{
    debug,
    utils::exec::{Echo, exec},
    versions::{
        RegistryError, VersionRegistry,
        links::RenderContext,
    },
};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;

pub const ENV_CURRENT_VERSION: &str = "VERSIONDOCS_CURRENT_VERSION";
pub const ENV_CONTEXT: &str = "VERSIONDOCS_CONTEXT";
pub const ENV_DISCOVER: &str = "VERSIONDOCS_DISCOVER";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("build failed for version `{version}`: {detail}")]
    Build { version: String, detail: String },

    #[error("reading config failed for version `{version}`: {detail}")]
    Discovery { version: String, detail: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What discovery learns about one version.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveredConfig {
    pub primary_page: String,
    #[serde(default)]
    pub found_pages: BTreeSet<String>,
}

/// Runs builds for one version at a time.
pub trait BuildEngine {
    /// Build `source` into `target`, rendering navigation from `view`.
    fn run_build(&self, source: &Path, target: &Path, view: &VersionRegistry, current: &str)
    -> Result<(), EngineError>;

    /// Read the primary page and page list of `source` without final output.
    fn discover_config(&self, source: &Path, current: &str) -> Result<DiscoveredConfig, EngineError>;
}

/// [`BuildEngine`] backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: Vec<String>,
    /// Arguments after `--` on the command line.
    overflow: Vec<String>,
    primary_page: String,
    pty: bool,
}

impl CommandEngine {
    pub fn new(command: Vec<String>, overflow: Vec<String>, primary_page: String, pty: bool) -> Self {
        Self {
            command,
            overflow,
            primary_page,
            pty,
        }
    }

    fn run(&self, source: &Path, target: &Path, env: &[(&str, OsString)]) -> anyhow::Result<()> {
        let mut argv: Vec<OsString> = self.command.iter().map(OsString::from).collect();
        argv.extend([source.into(), target.into()]);
        argv.extend(self.overflow.iter().map(OsString::from));
        debug!("build"; "running {:?}", argv);
        exec(None, &argv, env, Echo::Stderr, self.pty)?;
        Ok(())
    }
}

impl BuildEngine for CommandEngine {
    fn run_build(
        &self,
        source: &Path,
        target: &Path,
        view: &VersionRegistry,
        current: &str,
    ) -> Result<(), EngineError> {
        let context = RenderContext::new(view, current)?;
        let name = context.current_version.clone();
        let build_err = |detail: String| EngineError::Build {
            version: name.clone(),
            detail,
        };

        let temp = TempDir::new().map_err(|e| build_err(e.to_string()))?;
        let context_path = temp.path().join("context.json");
        let json = serde_json::to_vec_pretty(&context).map_err(|e| build_err(e.to_string()))?;
        fs::write(&context_path, json).map_err(|e| build_err(e.to_string()))?;

        let env = [
            (ENV_CURRENT_VERSION, OsString::from(&name)),
            (ENV_CONTEXT, context_path.into_os_string()),
        ];
        self.run(source, target, &env)
            .map_err(|e| build_err(format!("{e:#}")))
    }

    fn discover_config(&self, source: &Path, current: &str) -> Result<DiscoveredConfig, EngineError> {
        let discovery_err = |detail: String| EngineError::Discovery {
            version: current.to_owned(),
            detail,
        };

        let temp = TempDir::new().map_err(|e| discovery_err(e.to_string()))?;
        let out = temp.path().join("out");
        let manifest = temp.path().join("manifest.json");

        let env = [
            (ENV_CURRENT_VERSION, OsString::from(current)),
            (ENV_DISCOVER, manifest.clone().into_os_string()),
        ];
        self.run(source, &out, &env)
            .map_err(|e| discovery_err(format!("{e:#}")))?;

        if manifest.is_file() {
            let content = fs::read(&manifest).map_err(|e| discovery_err(e.to_string()))?;
            return serde_json::from_slice(&content).map_err(|e| discovery_err(e.to_string()));
        }

        Ok(DiscoveredConfig {
            primary_page: self.primary_page.clone(),
            found_pages: html_pages(&out),
        })
    }
}

/// Every `*.html` under `dir` as a `/`-separated path without extension.
pub fn html_pages(dir: &Path) -> BTreeSet<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(dir).ok()?;
            if rel.extension()? != "html" {
                return None;
            }
            let page: PathBuf = rel.with_extension("");
            let parts: Vec<String> = page
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Some(parts.join("/"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::{DEFAULT_PRIMARY_PAGE, VersionKind, tests::remote};

    #[test]
    fn test_html_pages() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("guide")).unwrap();
        fs::write(dir.path().join("contents.html"), "").unwrap();
        fs::write(dir.path().join("guide/install.html"), "").unwrap();
        fs::write(dir.path().join("searchindex.js"), "").unwrap();

        let pages = html_pages(dir.path());
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), ["contents", "guide/install"]);
    }

    #[test]
    fn test_html_pages_missing_dir() {
        assert!(html_pages(Path::new("/nonexistent/versiondocs")).is_empty());
    }

    #[test]
    fn test_manifest_shape() {
        let parsed: DiscoveredConfig =
            serde_json::from_str(r#"{"primary_page": "index", "found_pages": ["index", "a/b"]}"#).unwrap();
        assert_eq!(parsed.primary_page, "index");
        assert!(parsed.found_pages.contains("a/b"));

        let parsed: DiscoveredConfig = serde_json::from_str(r#"{"primary_page": "index"}"#).unwrap();
        assert!(parsed.found_pages.is_empty());
    }

    #[cfg(unix)]
    fn shell_engine(script: &str) -> CommandEngine {
        CommandEngine::new(
            vec!["sh".into(), "-c".into(), script.into(), "engine".into()],
            Vec::new(),
            DEFAULT_PRIMARY_PAGE.into(),
            false,
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_from_output_tree() {
        let source = TempDir::new().unwrap();
        let engine = shell_engine(r#"mkdir -p "$2/sub" && touch "$2/contents.html" "$2/sub/page.html""#);
        let config = engine.discover_config(source.path(), "master").unwrap();
        assert_eq!(config.primary_page, "contents");
        assert_eq!(config.found_pages.len(), 2);
        assert!(config.found_pages.contains("sub/page"));
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_from_manifest() {
        let source = TempDir::new().unwrap();
        let engine = shell_engine(
            r#"printf '{"primary_page":"index","found_pages":["index"]}' > "$VERSIONDOCS_DISCOVER""#,
        );
        let config = engine.discover_config(source.path(), "master").unwrap();
        assert_eq!(config.primary_page, "index");
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_failure() {
        let source = TempDir::new().unwrap();
        let engine = shell_engine("exit 2");
        let err = engine.discover_config(source.path(), "v1.0").unwrap_err();
        assert!(matches!(err, EngineError::Discovery { ref version, .. } if version == "v1.0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_build_passes_context() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let engine = shell_engine(
            r#"cp "$VERSIONDOCS_CONTEXT" "$2/context.json" && printf '%s' "$VERSIONDOCS_CURRENT_VERSION" > "$2/current""#,
        );

        let mut registry = VersionRegistry::build(
            vec![remote("sha1", "master", VersionKind::Branch, 1)],
            &[],
            None,
            false,
            DEFAULT_PRIMARY_PAGE,
        );
        registry.set_root("master").unwrap();

        engine.run_build(source.path(), target.path(), &registry, "master").unwrap();
        assert_eq!(fs::read_to_string(target.path().join("current")).unwrap(), "master");

        let context: serde_json::Value =
            serde_json::from_slice(&fs::read(target.path().join("context.json")).unwrap()).unwrap();
        assert_eq!(context["current_version"], "master");
        assert_eq!(context["is_root"], true);
        assert_eq!(context["pages"]["contents"][0]["url"], "contents.html");
    }

    #[test]
    fn test_run_build_unknown_version() {
        let engine = CommandEngine::new(vec!["true".into()], Vec::new(), DEFAULT_PRIMARY_PAGE.into(), false);
        let registry = VersionRegistry::default();
        let err = engine
            .run_build(Path::new("."), Path::new("."), &registry, "nope")
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::NotFound(_))));
    }
}
