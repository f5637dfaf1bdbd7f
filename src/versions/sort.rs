//! Ordering of versions.
//!
//! Three policies produce integer keys that compare element-wise:
//!
//! - `alpha`: code points of the name, zero padded to the longest name
//! - `chrono`: negated commit time, most recent first
//! - `semver`: negated version numbers then suffix code points, highest first
//!
//! Several policies are combined by concatenating their keys, so later
//! policies only break ties left by earlier ones.

use super::VersionEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Comparable sort key.
pub type Key = Vec<i64>;

/// Number of dotted integer groups a version name may carry.
const SEMVER_GROUPS: usize = 7;

/// Leading marker of a parsed version key.
const VALID: i64 = 0;
/// Leading marker of a name that is not a version. Sorts after every version.
const INVALID: i64 = 1;

/// A sort policy selectable on the command line and in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortPolicy {
    /// Lexical order of names.
    Alpha,
    /// Most recent commit first.
    #[serde(alias = "time")]
    #[value(alias = "time")]
    Chrono,
    /// Highest version number first; names that are not versions last.
    Semver,
}

fn semver_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^v?V?([0-9]+)",
            r"(?:\.([0-9]+))?(?:\.([0-9]+))?(?:\.([0-9]+))?",
            r"(?:\.([0-9]+))?(?:\.([0-9]+))?(?:\.([0-9]+))?",
            r"([\w.+-]*)$",
        ))
        .expect("valid semver regex")
    })
}

/// Integer groups and trailing suffix of a version name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemverParts<'a> {
    pub numbers: [i64; SEMVER_GROUPS],
    pub suffix: &'a str,
}

/// Split a version-looking name into its parts.
///
/// Missing groups are zero. Returns `None` when the name does not start with
/// a number (after an optional `v`/`V` prefix).
pub fn parse_semver(name: &str) -> Option<SemverParts<'_>> {
    let caps = semver_regex().captures(name)?;
    let mut numbers = [0; SEMVER_GROUPS];
    for (i, slot) in numbers.iter_mut().enumerate() {
        if let Some(m) = caps.get(i + 1) {
            *slot = m.as_str().parse().unwrap_or(i64::MAX);
        }
    }
    let suffix = caps.get(SEMVER_GROUPS + 1).map_or("", |m| m.as_str());
    Some(SemverParts { numbers, suffix })
}

/// Whether `name` parses as a version at all.
pub fn is_semver(name: &str) -> bool {
    semver_regex().is_match(name)
}

/// Semver key of one name, with the suffix padded to `suffix_width` chars.
///
/// Invalid names get an `INVALID` marker followed by zeros of the same width.
pub fn semver_key(name: &str, suffix_width: usize) -> Key {
    let width = 1 + SEMVER_GROUPS + suffix_width;
    let Some(parts) = parse_semver(name) else {
        let mut key = vec![0; width];
        key[0] = INVALID;
        return key;
    };

    let mut key = Vec::with_capacity(width);
    key.push(VALID);
    key.extend(parts.numbers.iter().map(|n| -n));
    key.extend(parts.suffix.chars().map(|c| i64::from(u32::from(c))));
    if key.len() < width {
        key.resize(width, 0);
    }
    key
}

/// Semver keys for a batch of names, padded to a common width.
///
/// When no name is a version every key is empty, leaving the order untouched.
pub fn semver_keys<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Key> {
    let names: Vec<&str> = names.into_iter().collect();
    let suffix_width = names
        .iter()
        .filter_map(|n| parse_semver(n))
        .map(|p| p.suffix.chars().count())
        .max();

    match suffix_width {
        Some(width) => names.iter().map(|n| semver_key(n, width)).collect(),
        None => vec![Key::new(); names.len()],
    }
}

/// Lexical key of one name, padded to `width` chars.
pub fn lexical_key(name: &str, width: usize) -> Key {
    let mut key: Key = name.chars().map(|c| i64::from(u32::from(c))).collect();
    if key.len() < width {
        key.resize(width, 0);
    }
    key
}

/// Lexical keys for a batch of names, padded to the longest name.
pub fn lexical_keys<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Key> {
    let names: Vec<&str> = names.into_iter().collect();
    let width = names.iter().map(|n| n.chars().count()).max().unwrap_or(0);
    names.iter().map(|n| lexical_key(n, width)).collect()
}

/// Chronological key: most recent first.
pub fn chronological_key(entry: &VersionEntry) -> Key {
    vec![-entry.commit_time]
}

/// Stable sort of `entries` by the concatenation of the policies' keys.
///
/// No policies is a no-op.
pub fn composite_sort(entries: &mut Vec<VersionEntry>, policies: &[SortPolicy]) {
    if policies.is_empty() || entries.is_empty() {
        return;
    }

    let alpha = policies
        .contains(&SortPolicy::Alpha)
        .then(|| lexical_keys(entries.iter().map(|e| e.name.as_str())));
    let semver = policies
        .contains(&SortPolicy::Semver)
        .then(|| semver_keys(entries.iter().map(|e| e.name.as_str())));

    let keys: Vec<Key> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let mut key = Key::new();
            for policy in policies {
                match policy {
                    SortPolicy::Alpha => key.extend_from_slice(alpha.as_ref().map_or(&[][..], |k| k[i].as_slice())),
                    SortPolicy::Chrono => key.extend(chronological_key(entry)),
                    SortPolicy::Semver => key.extend_from_slice(semver.as_ref().map_or(&[][..], |k| k[i].as_slice())),
                }
            }
            key
        })
        .collect();

    let mut keyed: Vec<(Key, VersionEntry)> = keys.into_iter().zip(entries.drain(..)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    entries.extend(keyed.into_iter().map(|(_, entry)| entry));
}
