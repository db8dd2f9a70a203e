//! Table schemas and the upgrade path
//!
//! A schema carries a version identifier, the column definitions and the
//! clustering comparator (bytewise per component here). Upgrading a
//! partition from one schema version to another remaps cells by column
//! name and drops columns absent from the target.

use crate::partition::PartitionData;
use crate::row::ColumnId;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies one version of a table's schema.
pub type SchemaVersion = u64;

/// Shared schema handle.
pub type SchemaRef = Arc<Schema>;

/// Kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Shared by the whole partition.
    Static,
    /// Per clustering row.
    Regular,
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column id, unique within the schema.
    pub id: ColumnId,
    /// Column name; upgrade matches columns by name.
    pub name: String,
    /// Static or regular.
    pub kind: ColumnKind,
}

/// A table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    version: SchemaVersion,
    columns: Vec<ColumnDef>,
    by_name: HashMap<String, ColumnId>,
    has_static: bool,
}

impl Schema {
    /// Starts building a schema for the given table.
    pub fn builder(table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            table: table.into(),
            version: 1,
            columns: Vec::new(),
        }
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Version identifier.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Column definitions in id order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Column id by name.
    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.by_name.get(name).copied()
    }

    /// Column definition by id.
    pub fn column(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Whether the schema has static columns.
    pub fn has_static_columns(&self) -> bool {
        self.has_static
    }

    /// Derives the next version of this schema with one more regular column.
    pub fn evolve_with_column(&self, name: impl Into<String>) -> Schema {
        let mut b = SchemaBuilder {
            table: self.table.clone(),
            version: self.version + 1,
            columns: self.columns.clone(),
        };
        let name = name.into();
        let id = b.columns.iter().map(|c| c.id).max().map_or(0, |m| m + 1);
        b.columns.push(ColumnDef {
            id,
            name,
            kind: ColumnKind::Regular,
        });
        b.build_inner()
    }

    /// Derives the next version of this schema without the named column.
    pub fn evolve_without_column(&self, name: &str) -> Schema {
        let b = SchemaBuilder {
            table: self.table.clone(),
            version: self.version + 1,
            columns: self
                .columns
                .iter()
                .filter(|c| c.name != name)
                .cloned()
                .collect(),
        };
        b.build_inner()
    }
}

/// Builder for [`Schema`].
pub struct SchemaBuilder {
    table: String,
    version: SchemaVersion,
    columns: Vec<ColumnDef>,
}

impl SchemaBuilder {
    /// Sets the version identifier.
    pub fn version(mut self, v: SchemaVersion) -> Self {
        self.version = v;
        self
    }

    /// Adds a regular column.
    pub fn regular_column(mut self, name: impl Into<String>) -> Self {
        let id = self.columns.iter().map(|c| c.id).max().map_or(0, |m| m + 1);
        self.columns.push(ColumnDef {
            id,
            name: name.into(),
            kind: ColumnKind::Regular,
        });
        self
    }

    /// Adds a static column.
    pub fn static_column(mut self, name: impl Into<String>) -> Self {
        let id = self.columns.iter().map(|c| c.id).max().map_or(0, |m| m + 1);
        self.columns.push(ColumnDef {
            id,
            name: name.into(),
            kind: ColumnKind::Static,
        });
        self
    }

    fn build_inner(self) -> Schema {
        let by_name = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.id))
            .collect();
        let has_static = self
            .columns
            .iter()
            .any(|c| c.kind == ColumnKind::Static);
        Schema {
            table: self.table,
            version: self.version,
            columns: self.columns,
            by_name,
            has_static,
        }
    }

    /// Finishes the schema.
    pub fn build(self) -> Schema {
        self.build_inner()
    }

    /// Finishes the schema behind a shared handle.
    pub fn build_shared(self) -> SchemaRef {
        Arc::new(self.build_inner())
    }
}

/// Rewrites a partition from one schema to another.
///
/// Cells are matched by column name; columns absent from the target schema
/// are dropped. Positions, tombstones and continuity are unaffected.
pub fn upgrade_partition(data: &mut PartitionData, from: &Schema, to: &Schema) {
    if from.version() == to.version() {
        return;
    }
    let map = |id: ColumnId| -> Option<ColumnId> {
        from.column(id).and_then(|c| to.column_id(&c.name))
    };
    let static_row = std::mem::take(data.static_row_mut());
    *data.static_row_mut() = static_row.remap(map);
    for entry in data.rows_mut().values_mut() {
        let row = std::mem::take(&mut entry.row);
        entry.row = row.remap(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ClusteringPrefix, Position};
    use crate::row::{Cell, RowEntry};

    #[test]
    fn upgrade_remaps_by_name() {
        let v1 = Schema::builder("t")
            .regular_column("a")
            .regular_column("b")
            .build();
        let v2 = v1.evolve_without_column("a");
        assert_ne!(v1.version(), v2.version());

        let mut data = PartitionData::new();
        let pos = Position::for_key(ClusteringPrefix::from_components([b"k".to_vec()]));
        let mut entry = RowEntry::new(pos.clone());
        entry
            .row
            .apply_cell(v1.column_id("a").unwrap(), Cell::live(1, b"x".to_vec()));
        entry
            .row
            .apply_cell(v1.column_id("b").unwrap(), Cell::live(1, b"y".to_vec()));
        data.apply_row(entry);

        upgrade_partition(&mut data, &v1, &v2);
        let row = &data.rows().get(&pos).unwrap().row;
        assert_eq!(row.len(), 1);
        assert!(row.cell(v2.column_id("b").unwrap()).is_some());
    }

    #[test]
    fn same_version_is_noop() {
        let s = Schema::builder("t").regular_column("a").build();
        let mut data = PartitionData::new();
        let before = data.clone();
        upgrade_partition(&mut data, &s, &s);
        assert_eq!(data, before);
    }
}
