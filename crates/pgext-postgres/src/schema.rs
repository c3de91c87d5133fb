//! Per-entity column accessor tables.
//!
//! An [`EntitySchema<T>`] lists, in table order, every persisted column of an
//! entity type together with a closure that reads the column's value out of a
//! record. Schemas are built once per type and kept in a [`SchemaRegistry`]
//! keyed by `TypeId`, so the bulk loader can resolve the column list for any
//! registered type.
//!
//! ```rust,ignore
//! let schema = EntitySchema::<User>::builder("Users")
//!     .primary_key("Id", PgType::Int8, |u| u.id.into())
//!     .column("Name", PgType::Text, |u| u.name.clone().into())
//!     .enum_column("Status", PgType::Int4, |u| ExtractedValue::from_enum(&u.status))
//!     .enum_list_column("Roles", PgType::array_of(PgType::Int4), |u| {
//!         ExtractedValue::enum_list(&u.roles)
//!     })
//!     .build()?;
//! SchemaRegistry::global().register(schema);
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::types::{ExtractedValue, PgType};
use crate::validation::validate_identifier;
use crate::{PgExtError, Result};

/// Declared semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Scalar,
    /// A single enumeration member.
    Enum,
    /// A sequence of enumeration members.
    EnumList,
}

type Accessor<T> = Arc<dyn Fn(&T) -> ExtractedValue + Send + Sync>;

/// One persisted column of an entity.
pub struct ColumnDescriptor<T> {
    pub name: String,
    pub pg_type: PgType,
    pub kind: ColumnKind,
    pub is_primary_key: bool,
    accessor: Accessor<T>,
}

impl<T> ColumnDescriptor<T> {
    pub fn new<F>(name: impl Into<String>, pg_type: PgType, kind: ColumnKind, accessor: F) -> Self
    where
        F: Fn(&T) -> ExtractedValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            pg_type,
            kind,
            is_primary_key: false,
            accessor: Arc::new(accessor),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    /// Reads this column's value from a record.
    pub fn read(&self, record: &T) -> ExtractedValue {
        (self.accessor)(record)
    }
}

impl<T> Clone for ColumnDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pg_type: self.pg_type.clone(),
            kind: self.kind,
            is_primary_key: self.is_primary_key,
            accessor: Arc::clone(&self.accessor),
        }
    }
}

impl<T> fmt::Debug for ColumnDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDescriptor")
            .field("name", &self.name)
            .field("pg_type", &self.pg_type)
            .field("kind", &self.kind)
            .field("is_primary_key", &self.is_primary_key)
            .finish()
    }
}

/// Table name plus the ordered column list of an entity type.
pub struct EntitySchema<T> {
    table: String,
    columns: Vec<ColumnDescriptor<T>>,
}

impl<T> Clone for EntitySchema<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            columns: self.columns.clone(),
        }
    }
}

impl<T> fmt::Debug for EntitySchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .finish()
    }
}

impl<T> EntitySchema<T> {
    pub fn builder(table: impl Into<String>) -> EntitySchemaBuilder<T> {
        EntitySchemaBuilder {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnDescriptor<T>] {
        &self.columns
    }

    /// Columns to load, in table order. Primary key columns are left out when
    /// the server generates them.
    pub fn load_columns(&self, server_generated_key: bool) -> Vec<&ColumnDescriptor<T>> {
        self.columns
            .iter()
            .filter(|c| !(server_generated_key && c.is_primary_key))
            .collect()
    }
}

/// Builder for [`EntitySchema`]. Validation happens in [`build`](Self::build).
pub struct EntitySchemaBuilder<T> {
    table: String,
    columns: Vec<ColumnDescriptor<T>>,
}

impl<T> EntitySchemaBuilder<T> {
    pub fn column<F>(mut self, name: &str, pg_type: PgType, accessor: F) -> Self
    where
        F: Fn(&T) -> ExtractedValue + Send + Sync + 'static,
    {
        self.columns
            .push(ColumnDescriptor::new(name, pg_type, ColumnKind::Scalar, accessor));
        self
    }

    pub fn primary_key<F>(mut self, name: &str, pg_type: PgType, accessor: F) -> Self
    where
        F: Fn(&T) -> ExtractedValue + Send + Sync + 'static,
    {
        self.columns.push(
            ColumnDescriptor::new(name, pg_type, ColumnKind::Scalar, accessor).primary_key(),
        );
        self
    }

    pub fn enum_column<F>(mut self, name: &str, pg_type: PgType, accessor: F) -> Self
    where
        F: Fn(&T) -> ExtractedValue + Send + Sync + 'static,
    {
        self.columns
            .push(ColumnDescriptor::new(name, pg_type, ColumnKind::Enum, accessor));
        self
    }

    pub fn enum_list_column<F>(mut self, name: &str, pg_type: PgType, accessor: F) -> Self
    where
        F: Fn(&T) -> ExtractedValue + Send + Sync + 'static,
    {
        self.columns
            .push(ColumnDescriptor::new(name, pg_type, ColumnKind::EnumList, accessor));
        self
    }

    pub fn descriptor(mut self, descriptor: ColumnDescriptor<T>) -> Self {
        self.columns.push(descriptor);
        self
    }

    /// Validates identifiers and rejects empty or duplicate column lists.
    pub fn build(self) -> Result<EntitySchema<T>> {
        validate_identifier(&self.table)?;

        if self.columns.is_empty() {
            return Err(PgExtError::Validation(format!(
                "Entity schema for '{}' has no columns",
                self.table
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(PgExtError::Validation(format!(
                    "Duplicate column '{}' in schema for '{}'",
                    column.name, self.table
                )));
            }
        }

        Ok(EntitySchema {
            table: self.table,
            columns: self.columns,
        })
    }
}

/// Maps Rust entity types to their schemas.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

static GLOBAL_REGISTRY: Lazy<SchemaRegistry> = Lazy::new(SchemaRegistry::new);

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> &'static SchemaRegistry {
        &GLOBAL_REGISTRY
    }

    /// Registers (or replaces) the schema for `T`.
    pub fn register<T: 'static>(&self, schema: EntitySchema<T>) {
        self.schemas
            .write()
            .insert(TypeId::of::<T>(), Arc::new(Arc::new(schema)));
    }

    pub fn resolve<T: 'static>(&self) -> Result<Arc<EntitySchema<T>>> {
        let schemas = self.schemas.read();
        schemas
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Arc<EntitySchema<T>>>())
            .cloned()
            .ok_or_else(|| {
                PgExtError::SchemaResolution(format!(
                    "No schema registered for entity type '{}'",
                    type_name::<T>()
                ))
            })
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.schemas.read().contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("registered", &self.len())
            .finish()
    }
}
