//! State dictionaries: nested mappings holding checkpoint content
//!
//! `StateDict` holds concrete values (the form produced by a load), while
//! `ShardedStateDict` may additionally hold `ShardedTensor` and
//! `ShardedObject` leaves describing this worker's slices. The structural
//! key set restricted to non-sharded leaves is expected to be identical
//! across all workers; sharded leaves legitimately differ per worker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{ShardedObject, ShardedTensor, Tensor};

/// Leaf or subtree of a concrete state dict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateEntry {
    /// Ordinary metadata value
    Value(Value),

    /// Fully assembled tensor
    Tensor(Tensor),

    /// Nested dictionary
    Dict(StateDict),
}

/// Arbitrary nested mapping from string keys to concrete leaves
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateDict(pub BTreeMap<String, StateEntry>);

impl StateDict {
    /// Create an empty state dict
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under a key, replacing any previous entry
    pub fn insert(&mut self, key: impl Into<String>, entry: impl Into<StateEntry>) {
        self.0.insert(key.into(), entry.into());
    }

    /// Get a direct child entry
    pub fn get(&self, key: &str) -> Option<&StateEntry> {
        self.0.get(key)
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the dict has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All leaves with their dot-separated paths, in deterministic key order
    pub fn iter_leaves(&self) -> Vec<(String, &StateEntry)> {
        let mut leaves = Vec::new();
        collect_leaves(self, "", &mut leaves);
        leaves
    }
}

fn collect_leaves<'a>(dict: &'a StateDict, prefix: &str, out: &mut Vec<(String, &'a StateEntry)>) {
    for (key, entry) in &dict.0 {
        let path = join_path(prefix, key);
        match entry {
            StateEntry::Dict(nested) => collect_leaves(nested, &path, out),
            leaf => out.push((path, leaf)),
        }
    }
}

impl From<Value> for StateEntry {
    fn from(value: Value) -> Self {
        StateEntry::Value(value)
    }
}

impl From<Tensor> for StateEntry {
    fn from(tensor: Tensor) -> Self {
        StateEntry::Tensor(tensor)
    }
}

impl From<StateDict> for StateEntry {
    fn from(dict: StateDict) -> Self {
        StateEntry::Dict(dict)
    }
}

/// Leaf or subtree of a sharded state dict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ShardedStateEntry {
    /// Ordinary metadata value, identical across the fleet
    Value(Value),

    /// This worker's slice of a logical tensor
    Tensor(ShardedTensor),

    /// This worker's shard of a logical object
    Object(ShardedObject),

    /// Nested dictionary
    Dict(ShardedStateDict),
}

/// State dict whose leaves may be sharded tensors or objects
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShardedStateDict(pub BTreeMap<String, ShardedStateEntry>);

impl ShardedStateDict {
    /// Create an empty sharded state dict
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry under a key, replacing any previous entry
    pub fn insert(&mut self, key: impl Into<String>, entry: impl Into<ShardedStateEntry>) {
        self.0.insert(key.into(), entry.into());
    }

    /// Get a direct child entry
    pub fn get(&self, key: &str) -> Option<&ShardedStateEntry> {
        self.0.get(key)
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the dict has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All leaves with their dot-separated paths, in deterministic key order
    pub fn iter_leaves(&self) -> Vec<(String, &ShardedStateEntry)> {
        let mut leaves = Vec::new();
        collect_sharded_leaves(self, "", &mut leaves);
        leaves
    }

    /// Flat view of all `ShardedTensor` leaves
    pub fn sharded_tensors(&self) -> Vec<(String, &ShardedTensor)> {
        self.iter_leaves()
            .into_iter()
            .filter_map(|(path, entry)| match entry {
                ShardedStateEntry::Tensor(t) => Some((path, t)),
                _ => None,
            })
            .collect()
    }

    /// Flat view of all `ShardedObject` leaves
    pub fn sharded_objects(&self) -> Vec<(String, &ShardedObject)> {
        self.iter_leaves()
            .into_iter()
            .filter_map(|(path, entry)| match entry {
                ShardedStateEntry::Object(o) => Some((path, o)),
                _ => None,
            })
            .collect()
    }

    /// Split into an objects-only skeleton and the remainder, preserving
    /// nesting. Used to route `ShardedObject` leaves to a strategy that
    /// handles them separately.
    pub fn extract_sharded_objects(&self) -> (ShardedStateDict, ShardedStateDict) {
        let mut objects = ShardedStateDict::new();
        let mut rest = ShardedStateDict::new();

        for (key, entry) in &self.0 {
            match entry {
                ShardedStateEntry::Object(o) => {
                    objects.insert(key.clone(), o.clone());
                }
                ShardedStateEntry::Dict(nested) => {
                    let (nested_objects, nested_rest) = nested.extract_sharded_objects();
                    if !nested_objects.is_empty() {
                        objects.insert(key.clone(), nested_objects);
                    }
                    if !nested_rest.is_empty() {
                        rest.insert(key.clone(), nested_rest);
                    }
                }
                other => {
                    rest.0.insert(key.clone(), other.clone());
                }
            }
        }

        (objects, rest)
    }

    /// Copy with all tensor and object payloads stripped
    pub fn to_metadata_only(&self) -> ShardedStateDict {
        let entries = self
            .0
            .iter()
            .map(|(key, entry)| {
                let stripped = match entry {
                    ShardedStateEntry::Tensor(t) => ShardedStateEntry::Tensor(t.without_data()),
                    ShardedStateEntry::Object(o) => ShardedStateEntry::Object(o.without_value()),
                    ShardedStateEntry::Dict(nested) => {
                        ShardedStateEntry::Dict(nested.to_metadata_only())
                    }
                    value => value.clone(),
                };
                (key.clone(), stripped)
            })
            .collect();
        ShardedStateDict(entries)
    }

    /// Validate every sharded leaf (rank agreement, bounds, payload length)
    pub fn validate(&self) -> Result<()> {
        for (_, entry) in self.iter_leaves() {
            match entry {
                ShardedStateEntry::Tensor(t) => t.validate()?,
                ShardedStateEntry::Object(o) => o.validate()?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn collect_sharded_leaves<'a>(
    dict: &'a ShardedStateDict,
    prefix: &str,
    out: &mut Vec<(String, &'a ShardedStateEntry)>,
) {
    for (key, entry) in &dict.0 {
        let path = join_path(prefix, key);
        match entry {
            ShardedStateEntry::Dict(nested) => collect_sharded_leaves(nested, &path, out),
            leaf => out.push((path, leaf)),
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

impl From<Value> for ShardedStateEntry {
    fn from(value: Value) -> Self {
        ShardedStateEntry::Value(value)
    }
}

impl From<ShardedTensor> for ShardedStateEntry {
    fn from(tensor: ShardedTensor) -> Self {
        ShardedStateEntry::Tensor(tensor)
    }
}

impl From<ShardedObject> for ShardedStateEntry {
    fn from(object: ShardedObject) -> Self {
        ShardedStateEntry::Object(object)
    }
}

impl From<ShardedStateDict> for ShardedStateEntry {
    fn from(dict: ShardedStateDict) -> Self {
        ShardedStateEntry::Dict(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dtype;
    use bytes::Bytes;
    use serde_json::json;

    fn sample_sharded_dict() -> ShardedStateDict {
        let mut optimizer = ShardedStateDict::new();
        optimizer.insert("step", json!(1000));
        optimizer.insert(
            "momentum",
            ShardedTensor::new(
                "optimizer.momentum",
                Dtype::F32,
                vec![8],
                vec![4],
                vec![4],
                Bytes::from(vec![0u8; 16]),
            ),
        );

        let mut dict = ShardedStateDict::new();
        dict.insert("iteration", json!(1000));
        dict.insert(
            "weight",
            ShardedTensor::new(
                "model.weight",
                Dtype::F32,
                vec![4, 4],
                vec![2, 0],
                vec![2, 4],
                Bytes::from(vec![1u8; 32]),
            ),
        );
        dict.insert(
            "rng",
            ShardedObject::new("rng_state", vec![2], vec![0], json!({"seed": 7})),
        );
        dict.insert("optimizer", optimizer);
        dict
    }

    #[test]
    fn test_iter_leaves_paths_are_deterministic() {
        let dict = sample_sharded_dict();
        let paths: Vec<String> = dict.iter_leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec![
                "iteration",
                "optimizer.momentum",
                "optimizer.step",
                "rng",
                "weight"
            ]
        );
    }

    #[test]
    fn test_sharded_views() {
        let dict = sample_sharded_dict();
        let tensors = dict.sharded_tensors();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].1.key, "optimizer.momentum");

        let objects = dict.sharded_objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].0, "rng");
    }

    #[test]
    fn test_extract_sharded_objects_preserves_nesting() {
        let mut inner = ShardedStateDict::new();
        inner.insert(
            "sampler",
            ShardedObject::new("dataloader.sampler", vec![2], vec![1], json!([1, 2, 3])),
        );
        inner.insert("batches_seen", json!(512));

        let mut dict = ShardedStateDict::new();
        dict.insert("dataloader", inner);
        dict.insert("epoch", json!(3));

        let (objects, rest) = dict.extract_sharded_objects();
        assert_eq!(objects.sharded_objects().len(), 1);
        assert_eq!(objects.sharded_objects()[0].0, "dataloader.sampler");
        assert!(objects.sharded_objects()[0].1.value.is_some());

        assert!(rest.sharded_objects().is_empty());
        let rest_paths: Vec<String> = rest.iter_leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(rest_paths, vec!["dataloader.batches_seen", "epoch"]);
    }

    #[test]
    fn test_to_metadata_only_strips_payloads() {
        let dict = sample_sharded_dict();
        let meta = dict.to_metadata_only();

        for (_, tensor) in meta.sharded_tensors() {
            assert!(tensor.data.is_none());
        }
        for (_, object) in meta.sharded_objects() {
            assert!(object.value.is_none());
        }
        // Non-sharded leaves survive untouched
        assert_eq!(meta.get("iteration"), Some(&ShardedStateEntry::Value(json!(1000))));
    }

    #[test]
    fn test_validate_reports_bad_leaf() {
        let mut dict = sample_sharded_dict();
        dict.insert(
            "broken",
            ShardedTensor::new(
                "model.broken",
                Dtype::F32,
                vec![4],
                vec![2],
                vec![4],
                Bytes::from(vec![0u8; 16]),
            ),
        );
        assert!(dict.validate().is_err());
    }

    #[test]
    fn test_state_dict_json_round_trip() {
        let mut dict = StateDict::new();
        dict.insert("iteration", json!(42));
        let mut nested = StateDict::new();
        nested.insert("lr", json!(0.001));
        dict.insert("schedule", nested);

        let encoded = serde_json::to_string(&dict).unwrap();
        let decoded: StateDict = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, dict);
    }
}
