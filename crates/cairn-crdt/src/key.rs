//! Hierarchical, path-like keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cleaned, `/`-separated path such as `/tasks/42/state`.
///
/// Keys always start with `/`, never end with one (except the root) and
/// contain no empty segments.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    pub fn new(path: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        Key(format!("/{}", segments.join("/")))
    }

    pub fn root() -> Self {
        Key("/".to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one or more segments.
    pub fn child(&self, name: impl AsRef<str>) -> Key {
        Key::new(format!("{}/{}", self.0, name.as_ref()))
    }

    /// Append another key's segments below this one.
    pub fn join(&self, other: &Key) -> Key {
        if other.is_root() {
            return self.clone();
        }
        Key::new(format!("{}{}", self.0, other.0))
    }

    pub fn parent(&self) -> Key {
        match self.0.rfind('/') {
            Some(0) | None => Key::root(),
            Some(idx) => Key(self.0[..idx].to_string()),
        }
    }

    /// Last segment, empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether `other` lives strictly below this key.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Whether this key equals `prefix` or lives below it.
    pub fn has_prefix(&self, prefix: &Key) -> bool {
        self == prefix || prefix.is_ancestor_of(self)
    }

    /// The part of this key below `prefix`.
    pub fn strip_prefix(&self, prefix: &Key) -> Option<Key> {
        if self == prefix {
            Some(Key::root())
        } else if prefix.is_ancestor_of(self) {
            Some(Key::new(&self.0[prefix.0.len()..]))
        } else {
            None
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new(s)
    }
}
