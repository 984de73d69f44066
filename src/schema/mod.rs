//! Per-resource field schemas and ingestion narrowing.

/// Storefront resource definitions.
pub mod catalog;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    entity::{Entity, FieldPatch, compare_values},
    error::SchemaError,
    types::{EntityId, ResourceName, Row},
};

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// JSON boolean.
    Bool,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON string.
    Text,
    /// RFC 3339 string or epoch milliseconds.
    Timestamp,
    /// Arbitrary JSON.
    Json,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Text => value.is_string(),
            Self::Timestamp => value.is_string() || value.is_i64() || value.is_u64(),
            Self::Json => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Bool => "a boolean",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Text => "a string",
            Self::Timestamp => "a timestamp",
            Self::Json => "JSON",
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column name.
    pub name: String,
    /// Semantic type.
    pub kind: FieldKind,
    /// Must be present and non-null on create and ingestion.
    pub required: bool,
}

/// What the ordering key means for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Explicit, user-editable position; enables reorder.
    SortIndex,
    /// Server creation time.
    CreatedAt,
    /// Display name.
    Name,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Ordering declared per resource, stable across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field holding the key.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
    /// Key semantics.
    pub kind: OrderKind,
}

impl OrderBy {
    /// Ascending explicit position.
    pub fn sort_index(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
            kind: OrderKind::SortIndex,
        }
    }

    /// Creation time in the given direction.
    pub fn created_at(field: &str, direction: Direction) -> Self {
        Self {
            field: field.to_string(),
            direction,
            kind: OrderKind::CreatedAt,
        }
    }

    /// Ascending name.
    pub fn name(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
            kind: OrderKind::Name,
        }
    }

    /// Compares two entities by this key.
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let ord = compare_values(a.get(&self.field), b.get(&self.field));
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// Explicit shape of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Remote resource name.
    pub name: ResourceName,
    /// Name of the id column.
    pub id_field: String,
    /// Declared fields, excluding the id.
    pub fields: Vec<FieldSpec>,
    /// Ordering key.
    pub order_by: OrderBy,
}

impl ResourceSchema {
    /// Starts a schema with an `id` column and the given ordering.
    pub fn new(name: &str, order_by: OrderBy) -> Self {
        Self {
            name: name.to_string(),
            id_field: "id".to_string(),
            fields: Vec::new(),
            order_by,
        }
    }

    /// Adds an optional field.
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    /// Adds a required field.
    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    /// Looks up a declared field.
    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True when the resource supports `reorder`.
    pub fn is_sortable(&self) -> bool {
        self.order_by.kind == OrderKind::SortIndex
    }

    /// Narrows a remote row into an [`Entity`].
    ///
    /// Undeclared columns are dropped; declared ones are type-checked and
    /// absent optional ones are materialized as `null`, so every entity
    /// carries the full declared shape.
    pub fn ingest(&self, row: &Row) -> Result<Entity, SchemaError> {
        let id = row
            .get(&self.id_field)
            .and_then(EntityId::from_json)
            .ok_or_else(|| SchemaError::MissingId(self.id_field.clone()))?;

        let mut entity = Entity::new(id);
        for spec in &self.fields {
            match row.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(SchemaError::MissingField(spec.name.clone()));
                }
                None | Some(Value::Null) => {
                    entity.fields.insert(spec.name.clone(), Value::Null);
                }
                Some(v) if spec.kind.accepts(v) => {
                    entity.fields.insert(spec.name.clone(), v.clone());
                }
                Some(_) => {
                    return Err(SchemaError::WrongType {
                        field: spec.name.clone(),
                        expected: spec.kind.name(),
                    });
                }
            }
        }

        let dropped = row
            .keys()
            .filter(|k| *k != &self.id_field && self.spec(k).is_none())
            .count();
        if dropped > 0 {
            debug!(resource = %self.name, dropped, "narrowed undeclared columns");
        }
        Ok(entity)
    }

    /// Narrows a partial row into a patch of the declared columns it carries.
    pub fn narrow_patch(&self, row: &Row) -> Result<FieldPatch, SchemaError> {
        let mut patch = FieldPatch::default();
        for spec in &self.fields {
            let Some(value) = row.get(&spec.name) else {
                continue;
            };
            if value.is_null() && spec.required {
                return Err(SchemaError::MissingField(spec.name.clone()));
            }
            if !value.is_null() && !spec.kind.accepts(value) {
                return Err(SchemaError::WrongType {
                    field: spec.name.clone(),
                    expected: spec.kind.name(),
                });
            }
            patch.set(&spec.name, value.clone());
        }
        Ok(patch)
    }

    /// Same as [`Self::ingest`] for a JSON value that should be an object.
    pub fn ingest_value(&self, value: &Value) -> Result<Entity, SchemaError> {
        let row = value.as_object().ok_or(SchemaError::NotAnObject)?;
        self.ingest(row)
    }

    /// Checks a create payload: every required field present, all typed.
    pub fn validate_create(&self, payload: &Row) -> Result<(), SchemaError> {
        for spec in &self.fields {
            if spec.required && matches!(payload.get(&spec.name), None | Some(Value::Null)) {
                return Err(SchemaError::MissingField(spec.name.clone()));
            }
        }
        self.validate_values(payload.iter())
    }

    /// Checks a sparse patch; required fields cannot be nulled.
    pub fn validate_patch(&self, patch: &FieldPatch) -> Result<(), SchemaError> {
        self.validate_values(patch.iter())
    }

    fn validate_values<'a>(
        &self,
        values: impl Iterator<Item = (&'a String, &'a Value)>,
    ) -> Result<(), SchemaError> {
        for (name, value) in values {
            if name == &self.id_field {
                return Err(SchemaError::UnknownField(name.clone()));
            }
            let spec = self
                .spec(name)
                .ok_or_else(|| SchemaError::UnknownField(name.clone()))?;
            if value.is_null() {
                if spec.required {
                    return Err(SchemaError::MissingField(name.clone()));
                }
                continue;
            }
            if !spec.kind.accepts(value) {
                return Err(SchemaError::WrongType {
                    field: name.clone(),
                    expected: spec.kind.name(),
                });
            }
        }
        Ok(())
    }
}
