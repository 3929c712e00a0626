// ============================================================================
// Schema Resolver
// ============================================================================
//
// Builds the default record shape from a structural template (an ordered
// list of typed value nodes) plus override fragments. The result is in
// stored form: poses and colors are already encoded as plain maps.
//
// ============================================================================

use crate::codec;
use crate::core::{Color, DataError, FieldMap, FieldValue, Pose, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One template entry, e.g. `{ "name": "Coins", "class": "IntValue", "value": 0 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    pub name: String,
    #[serde(flatten)]
    pub kind: TemplateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", content = "value")]
pub enum TemplateKind {
    StringValue(String),
    IntValue(i64),
    NumberValue(f64),
    BoolValue(bool),
    Color3Value(Color),
    CFrameValue(Pose),
    /// Container node; carries no value and is skipped.
    Folder,
}

impl TemplateNode {
    pub fn new(name: &str, kind: TemplateKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }

    /// The node's default in stored form, `None` for non-value nodes.
    pub fn stored_value(&self) -> Option<FieldValue> {
        match &self.kind {
            TemplateKind::StringValue(s) => Some(FieldValue::Text(s.clone())),
            TemplateKind::IntValue(i) => Some(FieldValue::Integer(*i)),
            TemplateKind::NumberValue(n) => Some(FieldValue::Number(*n)),
            TemplateKind::BoolValue(b) => Some(FieldValue::Bool(*b)),
            TemplateKind::Color3Value(c) => Some(codec::encode_color(c)),
            TemplateKind::CFrameValue(p) => Some(codec::encode_pose(p)),
            TemplateKind::Folder => None,
        }
    }
}

/// Template values first, then each override fragment in order; later
/// fragments win on conflicting top-level keys.
pub fn resolve_structure(structure: &[TemplateNode], overrides: &[FieldMap]) -> FieldMap {
    let mut resolved = FieldMap::new();
    for node in structure {
        if let Some(value) = node.stored_value() {
            resolved.insert(node.name.clone(), value);
        }
    }
    for fragment in overrides {
        let mut fragment = fragment.clone();
        codec::serialize_record(&mut fragment);
        resolved.extend(fragment);
    }
    resolved
}

/// Reads a template from a JSON array of nodes.
pub fn load_template<P: AsRef<Path>>(path: P) -> Result<Vec<TemplateNode>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|err| {
        DataError::Config(format!("cannot read template '{}': {}", path.display(), err))
    })?;
    serde_json::from_str(&text).map_err(|err| {
        DataError::Config(format!("invalid template '{}': {}", path.display(), err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Vec3;

    #[test]
    fn test_folders_skipped_and_shapes_encoded() {
        let structure = vec![
            TemplateNode::new("loginAmount", TemplateKind::IntValue(0)),
            TemplateNode::new("Stats", TemplateKind::Folder),
            TemplateNode::new("Tint", TemplateKind::Color3Value(Color::new(1.0, 0.0, 0.5))),
            TemplateNode::new("Spawn", TemplateKind::CFrameValue(Pose::at(Vec3::new(1.0, 2.0, 3.0)))),
        ];
        let resolved = resolve_structure(&structure, &[]);

        assert_eq!(resolved.len(), 3);
        assert!(!resolved.contains_key("Stats"));
        let tint = resolved["Tint"].as_map().unwrap();
        assert_eq!(tint["Red"], FieldValue::Integer(255));
        assert_eq!(tint["Blue"], FieldValue::Integer(127));
        assert!(resolved["Spawn"].as_map().unwrap().contains_key("Position"));
    }

    #[test]
    fn test_every_override_applies_in_order() {
        let structure = vec![TemplateNode::new("Coins", TemplateKind::IntValue(0))];
        let mut first = FieldMap::new();
        first.insert("Coins".into(), FieldValue::Integer(10));
        first.insert("Gems".into(), FieldValue::Integer(1));
        let mut second = FieldMap::new();
        second.insert("Coins".into(), FieldValue::Integer(20));

        let resolved = resolve_structure(&structure, &[first, second]);
        assert_eq!(resolved["Coins"], FieldValue::Integer(20));
        assert_eq!(resolved["Gems"], FieldValue::Integer(1));
    }

    #[test]
    fn test_template_json_shape() {
        let json = r#"[
            { "name": "Title", "class": "StringValue", "value": "Rookie" },
            { "name": "Music", "class": "BoolValue", "value": true },
            { "name": "Bag", "class": "Folder" }
        ]"#;
        let nodes: Vec<TemplateNode> = serde_json::from_str(json).unwrap();
        assert_eq!(nodes[0].kind, TemplateKind::StringValue("Rookie".into()));
        assert_eq!(nodes[2].kind, TemplateKind::Folder);
    }
}
