//! Directory slugs for version output.
//!
//! Every non-root version is written to a sibling directory of the root
//! version's output. The directory name is derived from the ref name and must
//! not collide with anything already present at the destination.

/// Replace every character outside `[0-9A-Za-z.-]` with an underscore.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive a collision-free slug for `name` and record it in `existing`.
///
/// Underscores are appended until the slug is not taken.
pub fn assign_slug(name: &str, existing: &mut Vec<String>) -> String {
    let mut slug = sanitize_name(name);
    while existing.iter().any(|e| *e == slug) {
        slug.push('_');
    }
    existing.push(slug.clone());
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("master"), "master");
        assert_eq!(sanitize_name("v2.0.0-rc1"), "v2.0.0-rc1");
        assert_eq!(sanitize_name("feature/login"), "feature_login");
        assert_eq!(sanitize_name("a b+c"), "a_b_c");
        assert_eq!(sanitize_name("文档"), "__");
    }

    #[test]
    fn test_assign_slug_avoids_root_entries() {
        let mut existing = vec!["_static".to_owned(), "contents.html".to_owned()];
        assert_eq!(assign_slug("_static", &mut existing), "_static_");
        assert_eq!(assign_slug("v1.0", &mut existing), "v1.0");
    }

    #[test]
    fn test_assign_slug_near_collision() {
        let mut existing = Vec::new();
        assert_eq!(assign_slug("a_b", &mut existing), "a_b");
        assert_eq!(assign_slug("a/b", &mut existing), "a_b_");
        assert_eq!(assign_slug("a+b", &mut existing), "a_b__");
        assert_eq!(existing.len(), 3);
    }
}
