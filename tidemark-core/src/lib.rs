//! Tidemark Core - Data Types
//!
//! Pure data structures shared by every Tidemark crate: query keys, key
//! matchers, the error taxonomy and the synchronization config.
//! This crate contains ONLY data types - no caching behavior.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod error;

pub use config::SyncConfig;
pub use error::*;

// ============================================================================
// KEY SEGMENTS
// ============================================================================

/// One primitive element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeySegment {
    /// Returns the string value if this is a string segment.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

// ============================================================================
// QUERY KEYS
// ============================================================================

/// Ordered identifier for a cached logical data request.
///
/// Keys are hierarchical by convention: `["campaigns"]` is a prefix of
/// `["campaigns", "7"]`, which lets a single [`KeyMatcher::Prefix`] invalidate
/// a whole family of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Build a key from its segments.
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// The empty key. Every key starts with it.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// True if `prefix` is an element-wise prefix of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Reject keys that cannot identify a request: no segments, or an empty
    /// string segment (an id that is not known yet).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        for (index, segment) in self.0.iter().enumerate() {
            if let KeySegment::Str(s) = segment {
                if s.trim().is_empty() {
                    return Err(ValidationError::EmptySegment { index });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", segment)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }
}

/// Build a [`QueryKey`] from a list of primitive values.
///
/// ```
/// use tidemark_core::{query_key, KeySegment};
///
/// let id = "7";
/// let key = query_key!["campaigns", id];
/// assert_eq!(key.segments()[1], KeySegment::Str("7".to_string()));
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::root()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::KeySegment::from($segment)),+])
    };
}

// ============================================================================
// KEY MATCHERS
// ============================================================================

/// Selects cache entries for invalidation: one exact key or every key
/// sharing a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMatcher {
    Exact(QueryKey),
    Prefix(QueryKey),
}

impl KeyMatcher {
    pub fn exact(key: QueryKey) -> Self {
        Self::Exact(key)
    }

    pub fn prefix(key: QueryKey) -> Self {
        Self::Prefix(key)
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Prefix(p) => key.starts_with(p),
        }
    }

    /// The key this matcher was built from.
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Exact(k) | Self::Prefix(k) => k,
        }
    }
}

impl fmt::Display for KeyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(k) => write!(f, "{}", k),
            Self::Prefix(k) => write!(f, "{}*", k),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
