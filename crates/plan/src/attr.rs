use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use stageflow_common::AttrId;

static NEXT_ATTR_ID: AtomicU64 = AtomicU64::new(1);

/// A named column with stable identity.
///
/// Two attributes with equal names may still be distinct columns; identity is
/// carried by `id` and survives renames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Stable identity, unique within the process.
    pub id: AttrId,
    /// Display name.
    pub name: String,
    /// Column type.
    pub data_type: DataType,
}

impl Attribute {
    /// Create an attribute with a freshly allocated id.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: AttrId(NEXT_ATTR_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            data_type,
        }
    }

    /// Copy of this attribute under a fresh id.
    pub fn with_new_id(&self) -> Self {
        Self::new(self.name.clone(), self.data_type.clone())
    }
}

/// Arrow schema over an attribute list.
pub fn schema_of(attrs: &[Attribute]) -> SchemaRef {
    Arc::new(Schema::new(
        attrs
            .iter()
            .map(|a| Field::new(&a.name, a.data_type.clone(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Positional attribute-rewriting map.
///
/// Stage inputs may expose different attribute ids than the stage they hide;
/// this map translates partitioning/ordering references across that boundary.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    by_id: HashMap<AttrId, Attribute>,
}

impl AttributeMap {
    /// Build a map translating `from[i]` to `to[i]`.
    pub fn between(from: &[Attribute], to: &[Attribute]) -> Self {
        let by_id = from
            .iter()
            .zip(to.iter())
            .map(|(f, t)| (f.id, t.clone()))
            .collect();
        Self { by_id }
    }

    /// Translate one attribute; attributes outside the map pass through.
    pub fn map_attr(&self, attr: &Attribute) -> Attribute {
        self.by_id.get(&attr.id).cloned().unwrap_or_else(|| attr.clone())
    }

    /// Translate an attribute list.
    pub fn map_all(&self, attrs: &[Attribute]) -> Vec<Attribute> {
        attrs.iter().map(|a| self.map_attr(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_distinct() {
        let a = Attribute::new("k", DataType::Int64);
        let b = Attribute::new("k", DataType::Int64);
        assert_ne!(a.id, b.id);
        assert_ne!(a.with_new_id().id, a.id);
    }

    #[test]
    fn map_translates_known_ids_only() {
        let from = vec![Attribute::new("k", DataType::Int64)];
        let to = vec![Attribute::new("k", DataType::Int64)];
        let map = AttributeMap::between(&from, &to);
        assert_eq!(map.map_attr(&from[0]).id, to[0].id);

        let stranger = Attribute::new("v", DataType::Utf8);
        assert_eq!(map.map_attr(&stranger).id, stranger.id);
    }
}
