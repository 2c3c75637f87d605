//! Addressable YAML tree
//!
//! A pipeline document is parsed once into an arena of nodes. Every mapping
//! carries a stable `__uuid` key (generated on first parse and preserved on
//! re-parse), every sequence gets an id derived from its parent, and each node
//! knows its yaml path and fully qualified name. Nodes are never mutated: edits
//! go through [`YamlTree::apply_updates`], which re-parses the whole document.

use crate::core::error::PlanError;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Key under which a mapping stores its node id
pub const UUID_FIELD_NAME: &str = "__uuid";

/// Structural kind of a tree node. Scalars are values, not nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Array,
}

#[derive(Debug, Clone)]
struct NodeData {
    uuid: String,
    /// Field name in the parent mapping, or `[i]` for sequence elements
    name: String,
    kind: NodeKind,
    parent: Option<usize>,
    children: Vec<usize>,
    yaml_path: String,
    value: Value,
}

/// Arena-backed tree built from a YAML document
#[derive(Debug, Clone)]
pub struct YamlTree {
    nodes: Vec<NodeData>,
    by_uuid: HashMap<String, usize>,
    by_path: HashMap<String, usize>,
    root_value: Value,
}

impl YamlTree {
    /// Parse a YAML document, assigning ids to any mapping that lacks one
    pub fn parse(yaml: &str) -> Result<Self, PlanError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, PlanError> {
        if !value.is_mapping() {
            return Err(PlanError::invalid_yaml("Root of a yaml document must be a mapping"));
        }
        assign_uuids(&mut value);

        let mut tree = Self {
            nodes: Vec::new(),
            by_uuid: HashMap::new(),
            by_path: HashMap::new(),
            root_value: Value::Null,
        };
        tree.build(&value, String::new(), None, String::new());
        tree.root_value = value;
        Ok(tree)
    }

    fn build(&mut self, value: &Value, name: String, parent: Option<usize>, yaml_path: String) -> Option<usize> {
        let (kind, uuid) = match value {
            Value::Mapping(map) => (NodeKind::Object, uuid_of(map).unwrap_or_default()),
            Value::Sequence(_) => {
                let parent_uuid = parent.map(|p| self.nodes[p].uuid.clone()).unwrap_or_default();
                (NodeKind::Array, format!("{}_{}", parent_uuid, name))
            }
            _ => return None,
        };

        let index = self.nodes.len();
        self.nodes.push(NodeData {
            uuid: uuid.clone(),
            name,
            kind,
            parent,
            children: Vec::new(),
            yaml_path: yaml_path.clone(),
            value: value.clone(),
        });
        self.by_uuid.insert(uuid, index);
        self.by_path.insert(yaml_path.clone(), index);

        let mut children = Vec::new();
        match value {
            Value::Mapping(map) => {
                for (key, child) in map {
                    let Some(key) = key.as_str() else { continue };
                    if key == UUID_FIELD_NAME {
                        continue;
                    }
                    let child_path = join_path(&yaml_path, key);
                    if let Some(child_index) = self.build(child, key.to_string(), Some(index), child_path) {
                        children.push(child_index);
                    }
                }
            }
            Value::Sequence(items) => {
                for (i, child) in items.iter().enumerate() {
                    let element = format!("[{}]", i);
                    let child_path = join_path(&yaml_path, &element);
                    if let Some(child_index) = self.build(child, element, Some(index), child_path) {
                        children.push(child_index);
                    }
                }
            }
            _ => {}
        }
        self.nodes[index].children = children;
        Some(index)
    }

    /// The document root (an unnamed mapping)
    pub fn root(&self) -> YamlNode<'_> {
        YamlNode { tree: self, index: 0 }
    }

    pub fn node_by_uuid(&self, uuid: &str) -> Option<YamlNode<'_>> {
        self.by_uuid.get(uuid).map(|&index| YamlNode { tree: self, index })
    }

    pub fn node_by_path(&self, yaml_path: &str) -> Option<YamlNode<'_>> {
        self.by_path.get(yaml_path).map(|&index| YamlNode { tree: self, index })
    }

    pub fn value(&self) -> &Value {
        &self.root_value
    }

    /// Replace the subtrees at the given yaml paths and re-parse the document.
    ///
    /// Ids already present in the replacement yaml are kept, so nodes that were
    /// referenced by plan nodes before the update still resolve afterwards.
    pub fn apply_updates(&self, updates: &BTreeMap<String, String>) -> Result<YamlTree, PlanError> {
        let mut root = self.root_value.clone();
        for (yaml_path, yaml) in updates {
            let replacement: Value = serde_yaml::from_str(yaml)?;
            let slot = value_at_path_mut(&mut root, yaml_path).ok_or_else(|| {
                PlanError::invalid_yaml(format!("Yaml path [{}] does not exist", yaml_path))
            })?;
            *slot = replacement;
        }
        YamlTree::from_value(root)
    }

    pub fn to_yaml_string(&self) -> Result<String, PlanError> {
        Ok(serde_yaml::to_string(&self.root_value)?)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Borrowed handle to one node of a [`YamlTree`]
#[derive(Debug, Clone, Copy)]
pub struct YamlNode<'a> {
    tree: &'a YamlTree,
    index: usize,
}

impl<'a> YamlNode<'a> {
    fn data(&self) -> &'a NodeData {
        &self.tree.nodes[self.index]
    }

    pub fn tree(&self) -> &'a YamlTree {
        self.tree
    }

    pub fn uuid(&self) -> &'a str {
        &self.data().uuid
    }

    /// Field name under which this node sits in its parent
    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    pub fn kind(&self) -> NodeKind {
        self.data().kind
    }

    pub fn yaml_path(&self) -> &'a str {
        &self.data().yaml_path
    }

    pub fn value(&self) -> &'a Value {
        &self.data().value
    }

    pub fn parent(&self) -> Option<YamlNode<'a>> {
        self.data().parent.map(|index| YamlNode { tree: self.tree, index })
    }

    pub fn children(&self) -> Vec<YamlNode<'a>> {
        self.data()
            .children
            .iter()
            .map(|&index| YamlNode { tree: self.tree, index })
            .collect()
    }

    /// Child object or array stored under `name`
    pub fn field(&self, name: &str) -> Option<YamlNode<'a>> {
        if self.kind() != NodeKind::Object {
            return None;
        }
        self.children().into_iter().find(|c| c.name() == name)
    }

    /// Raw value stored under `name`, scalars included
    pub fn field_value(&self, name: &str) -> Option<&'a Value> {
        self.value().as_mapping().and_then(|m| m.get(name))
    }

    pub fn string_field(&self, name: &str) -> Option<&'a str> {
        self.field_value(name).and_then(Value::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_value(name).is_some_and(|v| !v.is_null())
    }

    pub fn identifier(&self) -> Option<&'a str> {
        self.string_field("identifier")
    }

    /// The `type` attribute of the node, e.g. `Deployment`
    pub fn node_type(&self) -> Option<&'a str> {
        self.string_field("type")
    }

    pub fn is_array_element(&self) -> bool {
        self.parent().is_some_and(|p| p.kind() == NodeKind::Array)
    }

    /// Dotted path used to address this node from expressions.
    ///
    /// Array elements are skipped, and a node that is the single wrapped value
    /// of an array element (`stages[0].stage`) is named by its identifier.
    pub fn fqn(&self) -> String {
        let mut segments = Vec::new();
        let mut current = Some(*self);
        while let Some(node) = current {
            let parent = node.parent();
            if parent.is_none() {
                break;
            }
            if !node.is_array_element() {
                let wrapped_in_element = parent.is_some_and(|p| p.is_array_element());
                match node.identifier() {
                    Some(identifier) if wrapped_in_element => segments.push(identifier.to_string()),
                    _ => segments.push(node.name().to_string()),
                }
            }
            current = parent;
        }
        segments.reverse();
        segments.join(".")
    }

    /// Position of this node's array element in the enclosing sequence, when
    /// the node is the wrapped value of an element (`stages[i].stage`).
    fn element_position(&self) -> Option<(YamlNode<'a>, usize)> {
        let element = self.parent().filter(|p| p.is_array_element())?;
        let array = element.parent()?;
        let position = array.data().children.iter().position(|&i| i == element.index)?;
        Some((array, position))
    }

    /// Name of the sequence this node's element lives in, e.g. `stages`
    pub fn enclosing_array_name(&self) -> Option<&'a str> {
        self.element_position().map(|(array, _)| array.name())
    }

    /// Next sibling in the enclosing sequence whose wrapper key is one of
    /// `kinds`. For `stages[0].stage` this looks at `stages[1]`.
    pub fn next_sibling_from_parent_array(&self, kinds: &[&str]) -> Option<YamlNode<'a>> {
        let (array, position) = self.element_position()?;
        let next_element = array.children().into_iter().nth(position + 1)?;
        kinds.iter().find_map(|kind| next_element.field(kind))
    }

    /// First element's wrapped value in a sequence node
    pub fn first_wrapped_child(&self, kinds: &[&str]) -> Option<YamlNode<'a>> {
        if self.kind() != NodeKind::Array {
            return None;
        }
        let first = self.children().into_iter().next()?;
        kinds.iter().find_map(|kind| first.field(kind))
    }

    /// Wrapped values of every element in a sequence node, in order
    pub fn wrapped_children(&self, kinds: &[&str]) -> Vec<YamlNode<'a>> {
        if self.kind() != NodeKind::Array {
            return Vec::new();
        }
        self.children()
            .into_iter()
            .filter_map(|element| kinds.iter().find_map(|kind| element.field(kind)))
            .collect()
    }

    /// Walk up the tree to the first ancestor stored under `name`
    pub fn ancestor(&self, name: &str) -> Option<YamlNode<'a>> {
        let mut current = self.parent();
        while let Some(node) = current {
            if node.name() == name {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, PlanError> {
        serde_yaml::from_value(self.value().clone()).map_err(|e| {
            PlanError::invalid_yaml(format!("Invalid yaml at [{}]: {}", self.yaml_path(), e))
        })
    }

    /// Serialize this subtree, node ids included
    pub fn to_yaml_string(&self) -> Result<String, PlanError> {
        Ok(serde_yaml::to_string(self.value())?)
    }

    /// Serialize this subtree with node ids stripped
    pub fn to_clean_yaml_string(&self) -> Result<String, PlanError> {
        let mut value = self.value().clone();
        strip_uuids(&mut value);
        Ok(serde_yaml::to_string(&value)?)
    }
}

fn uuid_of(map: &Mapping) -> Option<String> {
    map.get(UUID_FIELD_NAME).and_then(Value::as_str).map(str::to_string)
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{}/{}", parent, segment)
    }
}

/// Give every mapping in `value` a `__uuid`, keeping existing ones
pub fn assign_uuids(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            if uuid_of(map).is_none() {
                map.insert(
                    Value::String(UUID_FIELD_NAME.to_string()),
                    Value::String(Uuid::new_v4().to_string()),
                );
            }
            for (_, child) in map.iter_mut() {
                assign_uuids(child);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(assign_uuids),
        _ => {}
    }
}

pub fn strip_uuids(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            map.remove(UUID_FIELD_NAME);
            for (_, child) in map.iter_mut() {
                strip_uuids(child);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(strip_uuids),
        _ => {}
    }
}

fn value_at_path_mut<'v>(root: &'v mut Value, yaml_path: &str) -> Option<&'v mut Value> {
    let mut current = root;
    for segment in yaml_path.split('/').filter(|s| !s.is_empty()) {
        current = match segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            Some(index) => {
                let index: usize = index.parse().ok()?;
                current.as_sequence_mut()?.get_mut(index)?
            }
            None => current.as_mapping_mut()?.get_mut(segment)?,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
pipeline:
  identifier: p1
  stages:
    - stage:
        identifier: deploy
        type: Deployment
        spec:
          execution:
            steps: []
    - stage:
        identifier: verify
        type: Deployment
"#;

    #[test]
    fn test_paths_and_fqn() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let spec = tree.node_by_path("pipeline/stages/[0]/stage/spec").unwrap();

        assert_eq!(spec.name(), "spec");
        assert_eq!(spec.fqn(), "pipeline.stages.deploy.spec");
        assert_eq!(spec.parent().unwrap().identifier(), Some("deploy"));
    }

    #[test]
    fn test_uuids_are_stable_across_reparse() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let stage = tree.node_by_path("pipeline/stages/[0]/stage").unwrap();
        let uuid = stage.uuid().to_string();

        let reparsed = YamlTree::parse(&tree.to_yaml_string().unwrap()).unwrap();
        let stage = reparsed.node_by_uuid(&uuid).unwrap();
        assert_eq!(stage.yaml_path(), "pipeline/stages/[0]/stage");

        let stages = reparsed.node_by_path("pipeline/stages").unwrap();
        assert_eq!(stages.kind(), NodeKind::Array);
        assert_eq!(
            stages.uuid(),
            format!("{}_stages", reparsed.node_by_path("pipeline").unwrap().uuid())
        );
    }

    #[test]
    fn test_next_sibling_from_parent_array() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let first = tree.node_by_path("pipeline/stages/[0]/stage").unwrap();
        let second = first.next_sibling_from_parent_array(&["stage", "parallel"]).unwrap();

        assert_eq!(second.identifier(), Some("verify"));
        assert!(second.next_sibling_from_parent_array(&["stage", "parallel"]).is_none());
        assert_eq!(first.enclosing_array_name(), Some("stages"));
    }

    #[test]
    fn test_apply_updates_replaces_subtree() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let mut updates = BTreeMap::new();
        updates.insert(
            "pipeline/stages/[1]/stage/type".to_string(),
            "Custom".to_string(),
        );

        let updated = tree.apply_updates(&updates).unwrap();
        let stage = updated.node_by_path("pipeline/stages/[1]/stage").unwrap();
        assert_eq!(stage.node_type(), Some("Custom"));

        updates.insert("pipeline/missing/path".to_string(), "x".to_string());
        assert!(tree.apply_updates(&updates).is_err());
    }

    #[test]
    fn test_clean_yaml_strips_ids() {
        let tree = YamlTree::parse(PIPELINE).unwrap();
        let stage = tree.node_by_path("pipeline/stages/[0]/stage").unwrap();
        assert!(stage.to_yaml_string().unwrap().contains(UUID_FIELD_NAME));
        assert!(!stage.to_clean_yaml_string().unwrap().contains(UUID_FIELD_NAME));
    }

    #[test]
    fn test_root_must_be_mapping() {
        assert!(YamlTree::parse("- a\n- b\n").is_err());
    }
}
