use std::collections::BTreeMap;

pub type NodeId = u64;
pub type Label = String;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    String(String),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    NodeRef(NodeId),
    List(Vec<PropertyValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeBody {
    pub id: NodeId,
    pub label: Label,
    pub properties: BTreeMap<String, PropertyValue>,
    pub edge_offsets: Vec<i32>,
    pub adjacency: Vec<PropertyValue>,
}

impl NodeBody {
    pub fn new(id: NodeId, label: impl Into<Label>) -> Self {
        Self {
            id,
            label: label.into(),
            properties: BTreeMap::new(),
            edge_offsets: Vec::new(),
            adjacency: Vec::new(),
        }
    }

    /// Multi-valued view of the property map: a list value under key `k`
    /// appears as one `(k, element)` pair per element, nested lists expanded
    /// the same way. Scalar values come through unchanged.
    pub fn flattened_properties(&self) -> Vec<(&str, &PropertyValue)> {
        let mut pairs = Vec::with_capacity(self.properties.len());
        for (key, value) in &self.properties {
            flatten_into(key, value, &mut pairs);
        }
        pairs
    }
}

fn flatten_into<'a>(key: &'a str, value: &'a PropertyValue, out: &mut Vec<(&'a str, &'a PropertyValue)>) {
    match value {
        PropertyValue::List(entries) => {
            for entry in entries {
                flatten_into(key, entry, out);
            }
        }
        other => out.push((key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattening_expands_list_values() {
        let mut body = NodeBody::new(1, "X");
        body.properties.insert(
            "tags".into(),
            PropertyValue::List(vec![
                PropertyValue::String("a".into()),
                PropertyValue::String("b".into()),
            ]),
        );
        body.properties
            .insert("size".into(), PropertyValue::Int(3));

        let flat = body.flattened_properties();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0], ("size", &PropertyValue::Int(3)));
        assert_eq!(flat[1], ("tags", &PropertyValue::String("a".into())));
        assert_eq!(flat[2], ("tags", &PropertyValue::String("b".into())));
    }

    #[test]
    fn nested_lists_flatten_to_siblings() {
        let mut body = NodeBody::new(2, "X");
        body.properties.insert(
            "k".into(),
            PropertyValue::List(vec![
                PropertyValue::Int(1),
                PropertyValue::List(vec![PropertyValue::Int(2), PropertyValue::Int(3)]),
            ]),
        );

        let flat = body.flattened_properties();
        let values: Vec<_> = flat.iter().map(|(_, v)| (*v).clone()).collect();
        assert_eq!(
            values,
            vec![
                PropertyValue::Int(1),
                PropertyValue::Int(2),
                PropertyValue::Int(3)
            ]
        );
    }
}
