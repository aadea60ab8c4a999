//! Document paths.
//!
//! A path is a `/`-separated list of property names starting at the
//! document root, e.g. `/address/city`. Paths only descend through objects.

use coffer_storage::SYSTEM_PROPERTIES;
use serde_json::Value;

use crate::error::EncryptionError;

/// Reserved property holding the encryption side channel.
pub const ENCRYPTION_PROPERTIES: &str = "_ei";

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').skip(1)
}

/// Checks that `path` is well formed and may be encrypted.
///
/// The document id, the partition key (and anything containing it), the
/// side channel and store-managed properties are off limits.
pub fn validate(path: &str, partition_key_paths: &[String]) -> Result<(), EncryptionError> {
    if !path.starts_with('/') || segments(path).any(str::is_empty) {
        return Err(EncryptionError::invalid_path(
            path,
            "paths must start with '/' and have no empty segments",
        ));
    }

    if path == "/id" {
        return Err(EncryptionError::invalid_path(path, "the document id cannot be encrypted"));
    }

    let top = segments(path).next().unwrap_or_default();
    if top == ENCRYPTION_PROPERTIES || SYSTEM_PROPERTIES.contains(&top) {
        return Err(EncryptionError::invalid_path(path, "reserved property"));
    }

    for pk in partition_key_paths {
        if pk == path || is_ancestor(path, pk) {
            return Err(EncryptionError::invalid_path(
                path,
                format!("part of the partition key {pk} cannot be encrypted"),
            ));
        }
    }

    Ok(())
}

/// Returns true if `ancestor` strictly contains `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Value at `path`, if every segment resolves.
pub fn value_at<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(document, |node, segment| node.as_object()?.get(segment))
}

/// Mutable value at `path`, if every segment resolves.
pub fn value_at_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    segments(path).try_fold(document, |node, segment| node.as_object_mut()?.get_mut(segment))
}

/// Sorts and deduplicates paths, dropping those nested under another.
///
/// Encrypting an ancestor already covers its descendants.
pub fn normalize<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut sorted: Vec<&str> = paths.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<String> = Vec::with_capacity(sorted.len());
    for path in sorted {
        if !out.iter().any(|kept| is_ancestor(kept, path)) {
            out.push(path.to_string());
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pk(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_restricted_paths() {
        let pk = pk(&["/tenant/region"]);

        for path in ["/id", "/tenant", "/tenant/region", "/_ei", "/_etag", "/_ts/x"] {
            let err = validate(path, &pk).unwrap_err();
            assert!(err.to_string().contains(path), "{err}");
        }
        for path in ["", "ssn", "/", "/a//b", "/a/"] {
            assert!(validate(path, &pk).is_err(), "should reject {path:?}");
        }

        validate("/ssn", &pk).unwrap();
        validate("/tenant2", &pk).unwrap();
        validate("/tenant/name", &pk).unwrap();
        validate("/identity", &pk).unwrap();
    }

    #[test]
    fn test_value_lookup() {
        let mut doc = json!({"a": {"b": {"c": 1}}, "arr": [1, 2]});

        assert_eq!(value_at(&doc, "/a/b/c"), Some(&json!(1)));
        assert!(value_at(&doc, "/a/x").is_none());
        assert!(value_at(&doc, "/arr/0").is_none());

        *value_at_mut(&mut doc, "/a/b").unwrap() = json!("x");
        assert_eq!(doc["a"]["b"], json!("x"));
    }

    #[test]
    fn test_normalize() {
        let paths = normalize(["/b", "/a/c", "/a", "/b", "/ab"]);
        assert_eq!(paths, vec!["/a", "/ab", "/b"]);
    }
}
