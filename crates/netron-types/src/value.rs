//! Values as they travel on the wire.

use crate::definition::{DefId, Definition};
use serde::{Deserialize, Serialize};

/// A payload element crossing the wire.
///
/// Plain data is carried as JSON. Objects passed by reference travel as
/// definitions owned by the sender, or as references to definitions owned by
/// the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    /// Plain structured data.
    Plain(serde_json::Value),
    /// An object owned by the sender, exposed by reference.
    Definition(Definition),
    /// An object owned by the receiver, handed back to it.
    Reference(DefId),
    /// Positional collection, processed element-wise.
    List(Vec<WireValue>),
}

impl WireValue {
    /// The JSON null value.
    pub fn null() -> Self {
        Self::Plain(serde_json::Value::Null)
    }

    /// All definitions carried by this value, depth first.
    pub fn definitions(&self) -> Vec<&Definition> {
        let mut out = Vec::new();
        self.collect_definitions(&mut out);
        out
    }

    fn collect_definitions<'a>(&'a self, out: &mut Vec<&'a Definition>) {
        match self {
            Self::Definition(def) => out.push(def),
            Self::List(items) => {
                for item in items {
                    item.collect_definitions(out);
                }
            }
            Self::Plain(_) | Self::Reference(_) => {}
        }
    }
}

impl From<serde_json::Value> for WireValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Plain(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ContextDescriptor;

    #[test]
    fn test_definitions_in_list_keep_order() {
        let desc = ContextDescriptor::new("Item");
        let value = WireValue::List(vec![
            WireValue::Definition(Definition::weak(3, None, &desc)),
            WireValue::Plain(serde_json::json!(1)),
            WireValue::List(vec![WireValue::Definition(Definition::weak(4, None, &desc))]),
        ]);
        let ids: Vec<DefId> = value.definitions().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_tagged_encoding() {
        let json = serde_json::to_value(WireValue::Reference(12)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "reference", "value": 12}));
    }
}
