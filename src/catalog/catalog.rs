//! System Catalog for SnapDB
//!
//! This module manages metadata about tables, constraints, indexes and
//! statistics. It performs lookup and registration only.

use super::schema::{
    Column, ColumnDefault, Constraint, FkAction, ForeignKey, IndexDef, Schema, TableDef,
    TableStatistics,
};
use super::types::DataType;
use crate::error::{Error, Result};
use crate::executor::Expr;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// System Catalog - manages all database metadata
#[derive(Debug)]
pub struct Catalog {
    /// Table definitions by name
    tables: RwLock<HashMap<String, Arc<TableDef>>>,
    /// Index definitions by name
    indexes: RwLock<HashMap<String, Arc<IndexDef>>>,
    /// Next table ID
    next_table_id: RwLock<u32>,
    /// Next index ID
    next_index_id: RwLock<u32>,
}

impl Catalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            next_table_id: RwLock::new(1),
            next_index_id: RwLock::new(1),
        }
    }

    /// Register a table. Primary key and unique constraints get a backing
    /// index named `<table>_pkey` / `<table>_<cols>_key`.
    pub fn create_table(&self, mut def: TableDef) -> Result<Arc<TableDef>> {
        def.normalize()?;

        let mut tables = self.tables.write();
        if tables.contains_key(&def.name) {
            return Err(Error::TableAlreadyExists(def.name.clone()));
        }

        for fk in def.foreign_keys() {
            let parent = if fk.ref_table == def.name {
                &def
            } else {
                tables
                    .get(&fk.ref_table)
                    .map(|t| t.as_ref())
                    .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?
            };
            validate_reference(&def, parent, fk)?;
        }

        let mut next_id = self.next_table_id.write();
        def.id = *next_id;
        *next_id += 1;

        let mut backing = Vec::new();
        if let Some(pk) = def.primary_key() {
            backing.push((format!("{}_pkey", def.name), pk.to_vec(), true));
        }
        for constraint in &def.constraints {
            if let Constraint::Unique(cols) = constraint {
                backing.push((format!("{}_{}_key", def.name, cols.join("_")), cols.clone(), false));
            }
        }

        let table_def = Arc::new(def);
        tables.insert(table_def.name.clone(), table_def.clone());
        drop(tables);

        let mut indexes = self.indexes.write();
        let mut next_index = self.next_index_id.write();
        for (name, columns, primary) in backing {
            let index = IndexDef::new(&name, &table_def.name, columns, *next_index)
                .unique(true)
                .primary(primary);
            *next_index += 1;
            indexes.insert(name, Arc::new(index));
        }

        info!(table = %table_def.name, id = table_def.id, "created table");
        Ok(table_def)
    }

    /// Get a table by name
    pub fn get_table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Check if a table exists
    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// List all table definitions, ordered by id
    pub fn list_tables(&self) -> Vec<Arc<TableDef>> {
        let mut tables: Vec<_> = self.tables.read().values().cloned().collect();
        tables.sort_by_key(|t| t.id);
        tables
    }

    /// Foreign keys in any table that reference `table`
    pub fn referencing(&self, table: &str) -> Vec<(Arc<TableDef>, ForeignKey)> {
        let mut refs = Vec::new();
        for child in self.list_tables() {
            for fk in child.foreign_keys() {
                if fk.ref_table == table {
                    refs.push((child.clone(), fk.clone()));
                }
            }
        }
        refs
    }

    /// Update table statistics
    pub fn update_table_stats(&self, name: &str, stats: TableStatistics) -> Result<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;

        let mut new_table = (**table).clone();
        new_table.stats = Some(stats);
        tables.insert(name.to_string(), Arc::new(new_table));

        Ok(())
    }

    /// Create an index
    pub fn create_index(
        &self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
        unique: bool,
    ) -> Result<Arc<IndexDef>> {
        let index_def = self.new_index_def(name, table_name, columns, unique)?;
        self.add_index(index_def.clone())?;
        Ok(index_def)
    }

    /// Validate an index and assign its id without publishing it
    pub fn new_index_def(
        &self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
        unique: bool,
    ) -> Result<Arc<IndexDef>> {
        let table = self.get_table(table_name)?;

        if columns.is_empty() {
            return Err(Error::InvalidSchema(format!("index '{}' has no columns", name)));
        }
        for col_name in &columns {
            if table.get_column(col_name).is_none() {
                return Err(Error::ColumnNotFound(
                    col_name.clone(),
                    table_name.to_string(),
                ));
            }
        }
        if self.indexes.read().contains_key(name) {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }

        let mut next_id = self.next_index_id.write();
        let index_def = Arc::new(IndexDef::new(name, table_name, columns, *next_id).unique(unique));
        *next_id += 1;
        Ok(index_def)
    }

    /// Publish an index definition to planners
    pub fn add_index(&self, index_def: Arc<IndexDef>) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&index_def.name) {
            return Err(Error::IndexAlreadyExists(index_def.name.clone()));
        }
        info!(
            index = %index_def.name,
            table = %index_def.table_name,
            unique = index_def.unique,
            "created index"
        );
        indexes.insert(index_def.name.clone(), index_def);
        Ok(())
    }

    /// Get an index by name
    pub fn get_index(&self, name: &str) -> Result<Arc<IndexDef>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Get all indexes for a table, ordered by id
    pub fn get_table_indexes(&self, table_name: &str) -> Vec<Arc<IndexDef>> {
        let mut found: Vec<_> = self
            .indexes
            .read()
            .values()
            .filter(|idx| idx.table_name == table_name)
            .cloned()
            .collect();
        found.sort_by_key(|idx| idx.id);
        found
    }

    /// The first index on `table_name` whose leading columns are `columns`
    pub fn find_index(&self, table_name: &str, columns: &[String]) -> Option<Arc<IndexDef>> {
        self.get_table_indexes(table_name)
            .into_iter()
            .find(|idx| idx.covers_prefix(columns))
    }

    /// Get table schema info as a formatted string
    pub fn get_table_info(&self, name: &str) -> Result<String> {
        let table = self.get_table(name)?;
        let mut info = format!("Table: {} (id {})\n", table.name(), table.id);
        info.push_str("Columns:\n");

        for col in table.schema().columns() {
            let mut flags = Vec::new();
            if !col.nullable {
                flags.push("NOT NULL".to_string());
            }
            match &col.default {
                Some(ColumnDefault::Value(v)) => flags.push(format!("DEFAULT {}", v)),
                Some(ColumnDefault::CurrentTimestamp) => {
                    flags.push("DEFAULT CURRENT_TIMESTAMP".to_string())
                }
                None => {}
            }

            let flags_str = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };

            info.push_str(&format!("  {} {}{}\n", col.name, col.data_type, flags_str));
        }

        let constraints: Vec<_> = table
            .constraints
            .iter()
            .filter(|c| !matches!(c, Constraint::NotNull(_)))
            .collect();
        if !constraints.is_empty() {
            info.push_str("Constraints:\n");
            for c in constraints {
                info.push_str(&format!("  {}\n", c));
            }
        }

        let indexes = self.get_table_indexes(name);
        if !indexes.is_empty() {
            info.push_str("Indexes:\n");
            for idx in indexes {
                info.push_str(&format!(
                    "  {} ({}){}\n",
                    idx.name,
                    idx.columns.join(", "),
                    if idx.unique { " UNIQUE" } else { "" }
                ));
            }
        }

        Ok(info)
    }

    /// Save catalog to disk
    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        let data = CatalogData {
            tables: self.list_tables().iter().map(|t| (**t).clone()).collect(),
            indexes: self.indexes.read().values().map(|i| (**i).clone()).collect(),
            next_table_id: *self.next_table_id.read(),
            next_index_id: *self.next_index_id.read(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load catalog from disk
    pub fn load_from_disk(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let data: CatalogData = serde_json::from_str(&json)?;

        let mut tables = HashMap::new();
        for table in data.tables {
            tables.insert(table.name.clone(), Arc::new(table));
        }

        let mut indexes = HashMap::new();
        for index in data.indexes {
            indexes.insert(index.name.clone(), Arc::new(index));
        }

        Ok(Self {
            tables: RwLock::new(tables),
            indexes: RwLock::new(indexes),
            next_table_id: RwLock::new(data.next_table_id),
            next_index_id: RwLock::new(data.next_index_id),
        })
    }
}

fn validate_reference(child: &TableDef, parent: &TableDef, fk: &ForeignKey) -> Result<()> {
    let is_key = parent
        .unique_keys()
        .iter()
        .any(|key| *key == fk.ref_columns.as_slice());
    if !is_key {
        return Err(Error::InvalidSchema(format!(
            "foreign key '{}' must reference a primary or unique key of '{}'",
            fk.name, parent.name
        )));
    }
    for (col, ref_col) in fk.columns.iter().zip(&fk.ref_columns) {
        let child_type = child
            .get_column(col)
            .ok_or_else(|| Error::ColumnNotFound(col.clone(), child.name.clone()))?
            .data_type;
        let parent_type = parent
            .get_column(ref_col)
            .ok_or_else(|| Error::ColumnNotFound(ref_col.clone(), parent.name.clone()))?
            .data_type;
        if !child_type.is_comparable_with(&parent_type) {
            return Err(Error::InvalidSchema(format!(
                "foreign key '{}': {} {} cannot reference {} {}",
                fk.name, col, child_type, ref_col, parent_type
            )));
        }
    }
    Ok(())
}

/// Serializable proxy for Catalog
#[derive(serde::Serialize, serde::Deserialize)]
struct CatalogData {
    tables: Vec<TableDef>,
    indexes: Vec<IndexDef>,
    next_table_id: u32,
    next_index_id: u32,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for table definitions with a fluent API
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    constraints: Vec<Constraint>,
}

impl TableBuilder {
    /// Start building a new table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Add a column
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let position = self.columns.len();
        self.columns.push(Column::new(name, data_type, position));
        self
    }

    /// Add a NOT NULL column
    pub fn column_not_null(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        self.constraints.push(Constraint::NotNull(name.clone()));
        let position = self.columns.len();
        self.columns.push(Column::new(name, data_type, position));
        self
    }

    /// Add a column with a default
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: ColumnDefault,
    ) -> Self {
        let position = self.columns.len();
        self.columns
            .push(Column::new(name, data_type, position).default(default));
        self
    }

    /// Add an INTEGER PRIMARY KEY column
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.constraints
            .push(Constraint::PrimaryKey(vec![name.clone()]));
        let position = self.columns.len();
        self.columns
            .push(Column::new(name, DataType::Integer, position));
        self
    }

    /// Declare a (possibly composite) primary key over existing columns
    pub fn primary_key_columns(mut self, columns: &[&str]) -> Self {
        self.constraints
            .push(Constraint::PrimaryKey(to_owned(columns)));
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.constraints.push(Constraint::Unique(to_owned(columns)));
        self
    }

    pub fn check(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.constraints.push(Constraint::Check {
            name: name.into(),
            expr,
        });
        self
    }

    pub fn foreign_key(
        mut self,
        columns: &[&str],
        ref_table: impl Into<String>,
        ref_columns: &[&str],
        on_delete: FkAction,
    ) -> Self {
        let ref_table = ref_table.into();
        let name = format!("{}_{}_fkey", self.name, columns.join("_"));
        self.constraints.push(Constraint::ForeignKey(ForeignKey {
            name,
            columns: to_owned(columns),
            ref_table,
            ref_columns: to_owned(ref_columns),
            on_delete,
        }));
        self
    }

    /// Finish the definition; the catalog assigns the id on registration
    pub fn build(self) -> TableDef {
        let mut def = TableDef::new(self.name, Schema::from_columns(self.columns), 0);
        def.constraints = self.constraints;
        def
    }
}

fn to_owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}
