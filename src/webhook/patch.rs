//! JSON patch accumulation against an unchanged Pod snapshot
//!
//! Paths follow what a structural diff between the original Pod and its
//! mutated copy would produce: an array the Pod does not have yet is added
//! whole, an array it already has is appended to at its current length.

use std::collections::HashMap;

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use serde_json::Value;

/// Accumulates `add` operations
#[derive(Debug, Default)]
pub struct PatchBuilder {
    ops: Vec<PatchOperation>,
    lengths: HashMap<String, usize>,
}

impl PatchBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` to the array at `path`
    ///
    /// `existing_len` is the array's length in the snapshot, `None` when the
    /// field is absent.
    pub fn append(&mut self, path: &[&str], existing_len: Option<usize>, item: Value) {
        let array = PointerBuf::from_tokens(path.iter().copied());
        let key = array.to_string();

        let op = match self.lengths.get(&key).copied().or(existing_len) {
            Some(len) => {
                let mut element = array;
                element.push_back(len.to_string());
                self.lengths.insert(key, len + 1);
                AddOperation {
                    path: element,
                    value: item,
                }
            }
            None => {
                self.lengths.insert(key, 1);
                AddOperation {
                    path: array,
                    value: Value::Array(vec![item]),
                }
            }
        };
        self.ops.push(PatchOperation::Add(op));
    }

    /// Number of operations so far
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operation was recorded
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Finish into a patch
    pub fn build(self) -> Patch {
        Patch(self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(patch: &Patch) -> Vec<String> {
        patch
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(add) => add.path.to_string(),
                other => panic!("unexpected operation {other:?}"),
            })
            .collect()
    }

    #[test]
    fn absent_array_is_added_whole() {
        let mut builder = PatchBuilder::new();
        builder.append(&["spec", "volumes"], None, json!({"name": "v"}));

        let patch = builder.build();
        assert_eq!(paths(&patch), vec!["/spec/volumes"]);
        let PatchOperation::Add(add) = &patch.0[0] else {
            unreachable!()
        };
        assert_eq!(add.value, json!([{"name": "v"}]));
    }

    #[test]
    fn existing_array_is_appended_at_its_length() {
        let mut builder = PatchBuilder::new();
        builder.append(&["spec", "containers", "0", "env"], Some(2), json!({"name": "A"}));

        assert_eq!(paths(&builder.build()), vec!["/spec/containers/0/env/2"]);
    }

    #[test]
    fn repeated_appends_advance_the_index() {
        let mut builder = PatchBuilder::new();
        builder.append(&["spec", "volumes"], None, json!({"name": "a"}));
        builder.append(&["spec", "volumes"], None, json!({"name": "b"}));
        builder.append(&["spec", "containers", "1", "env"], Some(0), json!({"name": "A"}));
        builder.append(&["spec", "containers", "1", "env"], Some(0), json!({"name": "B"}));

        assert_eq!(builder.len(), 4);
        assert_eq!(
            paths(&builder.build()),
            vec![
                "/spec/volumes",
                "/spec/volumes/1",
                "/spec/containers/1/env/0",
                "/spec/containers/1/env/1",
            ]
        );
    }

    #[test]
    fn patch_applies_to_the_snapshot() {
        let mut pod = json!({
            "spec": {"containers": [{"name": "app", "env": [{"name": "X", "value": "1"}]}]}
        });
        let mut builder = PatchBuilder::new();
        builder.append(&["spec", "volumes"], None, json!({"name": "creds"}));
        builder.append(&["spec", "containers", "0", "env"], Some(1), json!({"name": "Y"}));

        json_patch::patch(&mut pod, &builder.build()).unwrap();

        assert_eq!(pod["spec"]["volumes"][0]["name"], "creds");
        assert_eq!(pod["spec"]["containers"][0]["env"][1]["name"], "Y");
    }
}
