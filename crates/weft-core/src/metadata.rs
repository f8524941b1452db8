use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One typed attribute attached to an envelope.
///
/// The kind is a closed identifier (e.g. `subject`, `address`); the value is
/// opaque to the engine and only interpreted by broker adapters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    kind: String,
    value: Value,
}

impl MetadataItem {
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Ordered, kind-keyed metadata collection.
///
/// At most one item per kind. Iteration preserves insertion order; replacing
/// an existing kind keeps its original slot. Lookup is by kind, not position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    items: Vec<MetadataItem>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from items, later items replacing earlier ones of
    /// the same kind.
    pub fn of(items: impl IntoIterator<Item = MetadataItem>) -> Self {
        let mut metadata = Self::new();
        for item in items {
            metadata.insert(item);
        }
        metadata
    }

    /// Insert an item, replacing any existing item of the same kind.
    /// Returns the replaced item, if any.
    pub fn insert(&mut self, item: MetadataItem) -> Option<MetadataItem> {
        match self.items.iter_mut().find(|i| i.kind == item.kind) {
            Some(slot) => Some(std::mem::replace(slot, item)),
            None => {
                self.items.push(item);
                None
            }
        }
    }

    /// Consuming variant of [`insert`](Self::insert).
    pub fn with(mut self, item: MetadataItem) -> Self {
        self.insert(item);
        self
    }

    /// Look up the value stored under `kind`.
    pub fn get(&self, kind: &str) -> Option<&Value> {
        self.items.iter().find(|i| i.kind == kind).map(|i| &i.value)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.items.iter().any(|i| i.kind == kind)
    }

    /// Apply every item of `newer` over this collection. Items of `newer`
    /// replace same-kind items already present; everything else is kept.
    pub fn merge(&mut self, newer: Metadata) {
        for item in newer.items {
            self.insert(item);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl IntoIterator for Metadata {
    type Item = MetadataItem;
    type IntoIter = std::vec::IntoIter<MetadataItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn item(kind: &str, value: &str) -> MetadataItem {
        MetadataItem::new(kind, json!(value))
    }

    #[test]
    fn insert_appends_new_kinds_in_order() {
        let metadata = Metadata::new()
            .with(item("subject", "test"))
            .with(item("address", "orders"));

        let kinds: Vec<&str> = metadata.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, vec!["subject", "address"]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut metadata = Metadata::new()
            .with(item("subject", "first"))
            .with(item("address", "orders"));

        let replaced = metadata.insert(item("subject", "second"));
        assert_eq!(replaced, Some(item("subject", "first")));
        assert_eq!(metadata.get("subject"), Some(&json!("second")));

        // Replacement keeps the original slot.
        let kinds: Vec<&str> = metadata.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, vec!["subject", "address"]);
    }

    #[test]
    fn merge_keeps_untouched_items_and_applies_newer() {
        let mut original = Metadata::new()
            .with(item("subject", "old"))
            .with(item("address", "orders"));
        let newer = Metadata::new()
            .with(item("subject", "new"))
            .with(item("priority", "high"));

        original.merge(newer);

        assert_eq!(original.get("subject"), Some(&json!("new")));
        assert_eq!(original.get("address"), Some(&json!("orders")));
        assert_eq!(original.get("priority"), Some(&json!("high")));
        assert_eq!(original.len(), 3);
    }

    proptest! {
        /// However items are inserted, each kind appears at most once and
        /// lookup returns the last value inserted for that kind.
        #[test]
        fn at_most_one_item_per_kind(ops in prop::collection::vec(("[a-d]", "[a-z]{1,4}"), 0..32)) {
            let mut metadata = Metadata::new();
            let mut last: std::collections::HashMap<String, String> = Default::default();
            for (kind, value) in &ops {
                metadata.insert(MetadataItem::new(kind.clone(), json!(value)));
                last.insert(kind.clone(), value.clone());
            }

            prop_assert_eq!(metadata.len(), last.len());
            for (kind, value) in &last {
                prop_assert_eq!(metadata.get(kind), Some(&json!(value)));
            }
        }
    }
}
