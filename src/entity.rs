//! Entity records and sparse field patches.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityId, Row};

/// One record of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier.
    pub id: EntityId,
    /// Declared field values keyed by column name.
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Creates an entity with no fields.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Field value, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Boolean view of a field; absent and null read as false.
    pub fn flag(&self, field: &str) -> bool {
        self.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Converts back into a wire row with the id under `id_field`.
    pub fn to_row(&self, id_field: &str) -> Row {
        let mut row: Row = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(id) = self.id.as_server() {
            row.insert(id_field.to_string(), Value::String(id.to_string()));
        }
        row
    }
}

/// Sparse patch where each present field overwrites the entity value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldPatch {
    values: BTreeMap<String, Value>,
}

impl FieldPatch {
    /// Single-field patch.
    pub fn one(field: &str, value: Value) -> Self {
        let mut patch = Self::default();
        patch.set(field, value);
        patch
    }

    /// Builds a patch from a wire row.
    pub fn from_row(row: &Row) -> Self {
        Self {
            values: row.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    /// Sets one field.
    pub fn set(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    /// Value for `field`, if the patch touches it.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Drops `field` from the patch.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.values.remove(field)
    }

    /// True when the patch touches `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// Number of touched fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Touched field names.
    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Field/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Captures an inverse patch for all fields present in `self`.
    ///
    /// Fields absent on the entity are captured as `null`.
    pub fn capture_inverse_for(&self, entity: &Entity) -> Self {
        Self {
            values: self
                .values
                .keys()
                .map(|k| (k.clone(), entity.get(k).cloned().unwrap_or(Value::Null)))
                .collect(),
        }
    }

    /// Applies this patch in place to `entity`.
    pub fn apply_to(&self, entity: &mut Entity) {
        for (k, v) in &self.values {
            entity.fields.insert(k.clone(), v.clone());
        }
    }

    /// Wire payload for a remote update.
    pub fn to_row(&self) -> Row {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Total order over JSON scalars used for ordering keys.
///
/// Missing < null < bool < number < string; other shapes compare equal.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .unwrap_or(0.0)
                    .partial_cmp(&y.as_f64().unwrap_or(0.0))
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
