//! Reversible cache keys
//!
//! A key is the canonical JSON form of a [`Query`], base64 encoded. Because the
//! encoding is reversible, the store itself is the index of cached queries:
//! bulk refresh decodes stored keys instead of keeping a side table.

use crate::error::KeyError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use golist_types::Query;
use std::fmt;

/// Text-safe identity of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Wrap a key read back from the store. No validation happens here,
    /// `decode` is where malformed keys surface.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the cache key for a query
pub fn encode(query: &Query) -> CacheKey {
    // Query holds only strings, bools and integers, so serialization cannot fail.
    let json = serde_json::to_vec(query).unwrap_or_default();
    CacheKey(STANDARD.encode(json))
}

/// Rebuild the query a key was derived from
pub fn decode(key: &str) -> Result<Query, KeyError> {
    let json = STANDARD.decode(key)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use golist_types::LoadMode;

    fn full_query() -> Query {
        Query::new(
            "/home/dev/repo",
            vec!["./...".to_string(), "file=cmd/main.go".to_string()],
        )
        .with_mode(LoadMode::NEED_NAME | LoadMode::NEED_FILES | LoadMode::NEED_DEPS)
        .with_env(vec!["GOFLAGS=-mod=vendor".to_string(), "GOOS=linux".to_string()])
        .with_build_flags(vec!["-tags=integration".to_string()])
        .with_tests(true)
    }

    #[test]
    fn test_round_trip() {
        for query in [
            full_query(),
            Query::default(),
            Query::new("/repo", vec!["./...".to_string()]),
            Query::new("C:\\work\\répo", vec!["file=ü.go".to_string()]),
        ] {
            let key = encode(&query);
            assert_eq!(decode(key.as_str()).unwrap(), query);
        }
    }

    #[test]
    fn test_equal_queries_share_a_key() {
        let a = full_query();
        let b = full_query();
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_env_order_is_significant() {
        let a = Query::new("/repo", vec![]).with_env(vec!["A=1".into(), "B=2".into()]);
        let b = Query::new("/repo", vec![]).with_env(vec!["B=2".into(), "A=1".into()]);
        assert_ne!(encode(&a), encode(&b));
    }

    #[test]
    fn test_any_field_changes_the_key() {
        let base = full_query();
        let variants = [
            base.clone().with_tests(false),
            base.clone().with_mode(LoadMode::NEED_NAME),
            base.clone().with_build_flags(vec![]),
            Query {
                dir: "/other".into(),
                ..base.clone()
            },
        ];
        for variant in variants {
            assert_ne!(encode(&variant), encode(&base));
        }
    }

    #[test]
    fn test_key_is_text_safe() {
        let key = encode(&full_query());
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = decode("not base64 at all!").unwrap_err();
        assert!(matches!(err, KeyError::Base64(_)));
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let key = STANDARD.encode(b"{\"patterns\": 42}");
        let err = decode(&key).unwrap_err();
        assert!(matches!(err, KeyError::Json(_)));
    }
}
