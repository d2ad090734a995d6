//! Key, tag and namespace validation, and the namespaced id scheme.
//!
//! Every identifier handed to a backend is produced here. Item ids are
//! `<namespace>:<key>`; tag ids are `<namespace>\0tags\0<tag>`. The NUL
//! bytes cannot appear in a validated key, tag or namespace, so an item id
//! can never collide with a tag id, and ids from differently-namespaced
//! pools can never collide with each other.

use crate::{error::Error, Result};

/// Characters that may not appear in keys, tags or namespaces.
pub const RESERVED_CHARS: &[char] = &['{', '}', '(', ')', '/', '\\', '@', ':'];

const MAX_NAMESPACE_LEN: usize = 64;
const TAG_MARK: &str = "\0tags\0";

fn check_charset(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", what)));
    }
    for c in value.chars() {
        if c.is_control() || RESERVED_CHARS.contains(&c) {
            return Err(Error::InvalidInput(format!(
                "{} {:?} contains reserved character {:?}",
                what, value, c
            )));
        }
    }
    Ok(())
}

/// Validates a user-supplied cache key.
pub fn validate_key(key: &str) -> Result<()> {
    check_charset(key, "cache key")
}

/// Validates a user-supplied tag name. Tags share the key charset.
pub fn validate_tag(tag: &str) -> Result<()> {
    check_charset(tag, "cache tag")
}

/// Validates a pool namespace. The empty namespace is allowed.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Ok(());
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(Error::InvalidInput(format!(
            "namespace exceeds {} characters",
            MAX_NAMESPACE_LEN
        )));
    }
    check_charset(namespace, "namespace")
}

/// The prefix shared by every item id of a namespace.
pub fn item_prefix(namespace: &str) -> String {
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{}:", namespace)
    }
}

/// The prefix shared by every tag id of a namespace.
pub fn tag_prefix(namespace: &str) -> String {
    format!("{}{}", namespace, TAG_MARK)
}

/// Maps a validated key to its backend item id.
pub fn item_id(namespace: &str, key: &str) -> String {
    format!("{}{}", item_prefix(namespace), key)
}

/// Maps a validated tag name to its backend tag id.
pub fn tag_id(namespace: &str, tag: &str) -> String {
    format!("{}{}", tag_prefix(namespace), tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_characters_rejected() {
        for bad in ["a{b", "a}b", "a(b", "a)b", "a/b", "a\\b", "a@b", "a:b", "a\nb", ""] {
            assert!(validate_key(bad).is_err(), "key {:?} should be rejected", bad);
            assert!(validate_tag(bad).is_err(), "tag {:?} should be rejected", bad);
        }
        assert!(validate_key("user.42_profile-v2").is_ok());
        assert!(validate_tag("users").is_ok());
    }

    #[test]
    fn test_namespace_rules() {
        assert!(validate_namespace("").is_ok());
        assert!(validate_namespace("app1").is_ok());
        assert!(validate_namespace("app:1").is_err());
        assert!(validate_namespace(&"n".repeat(65)).is_err());
    }

    #[test]
    fn test_distinct_pairs_never_collide() {
        // Distinct (namespace, key) pairs map to distinct item ids even when
        // their concatenations look similar.
        assert_ne!(item_id("app", "1.k"), item_id("app1", ".k"));
        assert_ne!(item_id("", "k"), item_id("k", "k"));
        assert_ne!(tag_id("app", "t"), tag_id("app1", "t"));
    }

    #[test]
    fn test_item_and_tag_ids_disjoint() {
        // A tag id always contains a NUL byte, which no validated key can
        // carry into an item id.
        let tag = tag_id("ns", "anything");
        assert!(tag.contains('\0'));
        assert!(!item_id("ns", "anything").contains('\0'));
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(item_prefix(""), "");
        assert_eq!(item_prefix("app"), "app:");
        assert_eq!(item_id("app", "k"), "app:k");
        assert_eq!(tag_id("app", "t"), "app\0tags\0t");
    }
}
