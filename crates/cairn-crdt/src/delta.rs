//! Deltas: the unit of mutation exchanged between replicas.
//!
//! A delta holds the additions and the removed keys produced by one publish.
//! Every element inherits the delta's priority, which is the causal height of
//! the DAG node that carries it.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};

/// One logical mutation. `value` is empty for tombstones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
}

impl Element {
    pub fn addition(key: impl Into<String>, value: Vec<u8>) -> Self {
        Element {
            key: key.into(),
            value,
        }
    }

    pub fn tombstone(key: impl Into<String>) -> Self {
        Element {
            key: key.into(),
            value: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub elements: Vec<Element>,
    pub tombstones: Vec<Element>,
    pub priority: u64,
}

impl Delta {
    pub fn new() -> Self {
        Delta::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tombstones.is_empty()
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.elements.len() + self.tombstones.len()
    }

    /// Approximate payload size in bytes.
    pub fn size(&self) -> usize {
        self.elements
            .iter()
            .chain(self.tombstones.iter())
            .map(|e| e.key.len() + e.value.len())
            .sum()
    }

    /// Stage an addition. Replaces a pending addition or tombstone of the key.
    pub fn add(&mut self, key: impl Into<String>, value: Vec<u8>) -> usize {
        let key = key.into();
        self.tombstones.retain(|t| t.key != key);
        self.elements.retain(|e| e.key != key);
        self.elements.push(Element::addition(key, value));
        self.len()
    }

    /// Stage a removal, dropping any pending addition of the key.
    pub fn remove(&mut self, key: impl Into<String>) -> usize {
        let key = key.into();
        self.elements.retain(|e| e.key != key);
        if !self.tombstones.iter().any(|t| t.key == key) {
            self.tombstones.push(Element::tombstone(key));
        }
        self.len()
    }

    /// Combine two deltas, `b` staged after `a`: operations of `b` replace
    /// those of `a` on the same key and the higher priority is kept.
    pub fn merge(a: &Delta, b: &Delta) -> Delta {
        let mut merged = a.clone();
        for tomb in &b.tombstones {
            merged.remove(tomb.key.clone());
        }
        for element in &b.elements {
            merged.add(element.key.clone(), element.value.clone());
        }
        merged.priority = a.priority.max(b.priority);
        merged
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_remove_same_key() {
        let mut delta = Delta::new();
        assert_eq!(delta.add("/a", b"1".to_vec()), 1);
        assert_eq!(delta.remove("/a"), 1);

        assert!(delta.elements.is_empty());
        assert_eq!(delta.tombstones, vec![Element::tombstone("/a")]);
    }

    #[test]
    fn test_remove_then_add_same_key() {
        let mut delta = Delta::new();
        delta.remove("/a");
        delta.remove("/a");
        assert_eq!(delta.tombstones.len(), 1);

        delta.add("/a", b"2".to_vec());
        assert!(delta.tombstones.is_empty());
        assert_eq!(delta.elements, vec![Element::addition("/a", b"2".to_vec())]);
    }

    #[test]
    fn test_add_replaces_pending_value() {
        let mut delta = Delta::new();
        delta.add("/a", b"1".to_vec());
        delta.add("/a", b"2".to_vec());

        assert_eq!(delta.elements, vec![Element::addition("/a", b"2".to_vec())]);
        assert_eq!(delta.size(), 3);
    }

    #[test]
    fn test_merge_keeps_max_priority() {
        let mut a = Delta::new();
        a.add("/a", b"1".to_vec());
        a.priority = 3;
        let mut b = Delta::new();
        b.remove("/b");
        b.priority = 5;

        let merged = Delta::merge(&a, &b);
        assert_eq!(merged.priority, 5);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_later_ops_win() {
        let mut a = Delta::new();
        a.add("/a", b"old".to_vec());
        a.remove("/b");
        let mut b = Delta::new();
        b.add("/a", b"new".to_vec());
        b.add("/b", b"back".to_vec());

        let merged = Delta::merge(&a, &b);
        assert!(merged.tombstones.is_empty());
        assert_eq!(
            merged.elements,
            vec![
                Element::addition("/a", b"new".to_vec()),
                Element::addition("/b", b"back".to_vec()),
            ]
        );
    }

    #[test]
    fn test_codec() {
        let mut delta = Delta::new();
        delta.add("/a", b"1".to_vec());
        delta.remove("/b");
        delta.priority = 9;

        let bytes = delta.encode().unwrap();
        assert_eq!(Delta::decode(&bytes).unwrap(), delta);
        assert!(matches!(Delta::decode(b"[1,2"), Err(StoreError::Decode(_))));
    }
}
