//! Cross-version links.
//!
//! For a page rendered in one version, computes the relative url of the same
//! page in every other version, falling back to that version's primary page
//! when the page does not exist there.

use super::{RegistryError, VersionFlags, VersionKind, VersionRegistry};
use serde::Serialize;
use std::collections::BTreeMap;

/// One entry of a version switcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionLink {
    pub name: String,
    pub url: String,
}

/// Links from `page` of `current` to every version, in registry order.
///
/// `depth` is the number of directories between the page and the destination
/// root. Fails if `current` is not in the registry.
pub fn resolve_links(
    registry: &VersionRegistry,
    current: &str,
    page: &str,
    depth: usize,
) -> Result<Vec<VersionLink>, RegistryError> {
    let current = registry.lookup(current)?;
    let current_is_root = registry.is_root(current);

    let links = registry
        .entries()
        .iter()
        .map(|entry| {
            let url = if entry.id == current.id && !current_is_root {
                let basename = page.rsplit('/').next().unwrap_or(page);
                format!("{basename}.html")
            } else {
                let mut parts = vec![".."; depth];
                if !registry.is_root(entry) {
                    parts.push(entry.dir());
                }
                let has_page = entry.id == current.id || entry.found_pages.contains(page);
                parts.push(if has_page { page } else { entry.primary_page.as_str() });
                format!("{}.html", parts.join("/"))
            };
            VersionLink {
                name: entry.name.clone(),
                url,
            }
        })
        .collect();

    Ok(links)
}

/// Links for `page` as seen through a registry view.
///
/// The view's base depth plus one level per `/` in the page id.
pub fn page_links(
    view: &VersionRegistry,
    current: &str,
    page: &str,
) -> Result<Vec<VersionLink>, RegistryError> {
    let depth = view.depth() + page.matches('/').count();
    resolve_links(view, current, page, depth)
}

// ============================================================================
// Render context
// ============================================================================

/// A version as exposed to templates.
#[derive(Debug, Clone, Serialize)]
pub struct ContextVersion {
    pub id: String,
    pub name: String,
    pub kind: VersionKind,
    pub url: String,
    #[serde(flatten)]
    pub flags: VersionFlags,
}

/// Everything a build needs to render version navigation.
///
/// Serialized to JSON and handed to the engine subprocess.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub current_version: String,
    pub is_root: bool,
    pub versions: Vec<ContextVersion>,
    /// Switcher links for every page of the current version.
    pub pages: BTreeMap<String, Vec<VersionLink>>,
}

impl RenderContext {
    pub fn new(view: &VersionRegistry, current: &str) -> Result<Self, RegistryError> {
        let entry = view.lookup(current)?;

        let versions = view
            .entries()
            .iter()
            .map(|e| ContextVersion {
                id: e.id.clone(),
                name: e.name.clone(),
                kind: e.kind,
                url: e.url.clone(),
                flags: view.flags(e),
            })
            .collect();

        let mut pages = BTreeMap::new();
        for page in entry.found_pages.iter().chain(std::iter::once(&entry.primary_page)) {
            if !pages.contains_key(page) {
                pages.insert(page.clone(), page_links(view, &entry.id, page)?);
            }
        }

        Ok(Self {
            current_version: entry.name.clone(),
            is_root: view.is_root(entry),
            versions,
            pages,
        })
    }
}
