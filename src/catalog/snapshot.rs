use std::collections::{BTreeSet, HashMap};
use serde::{Deserialize, Serialize};

/// One column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(rename = "udt_name")]
    pub underlying_type_name: String,
    /// Labels in enum sort order, present only for enum-typed columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// `schema.table` key used by the enum index.
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Raw row of the introspection query, before grouping into tables.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub udt_name: String,
    /// `", "`-joined enum labels
    pub enum_values: Option<String>,
}

/// Introspected tables of the whitelisted schemas.
///
/// Holds exactly one `TableInfo` per `(schema, table)` pair, in the order the
/// pairs first appear in the catalog rows; columns keep declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableInfo>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableInfo>) -> Self {
        Self { tables }
    }

    /// Group catalog rows into tables.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = CatalogRow>,
    {
        let mut tables: Vec<TableInfo> = Vec::new();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();

        for row in rows {
            let key = (row.table_schema.clone(), row.table_name.clone());
            let idx = *positions.entry(key).or_insert_with(|| {
                tables.push(TableInfo {
                    schema: row.table_schema.clone(),
                    name: row.table_name.clone(),
                    columns: Vec::new(),
                });
                tables.len() - 1
            });

            let enum_values = row
                .enum_values
                .filter(|labels| !labels.is_empty())
                .map(|labels| labels.split(", ").map(str::to_string).collect());

            tables[idx].columns.push(ColumnInfo {
                name: row.column_name,
                data_type: row.data_type,
                underlying_type_name: row.udt_name,
                enum_values,
            });
        }

        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.columns.len()).sum()
    }

    pub fn find_table(&self, schema: &str, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.schema == schema && t.name == name)
    }
}

/// Lowercase bare table name -> schemas containing a table of that name.
#[derive(Debug, Clone, Default)]
pub struct TableIndex {
    tables: HashMap<String, BTreeSet<String>>,
}

impl TableIndex {
    pub fn build(snapshot: &SchemaSnapshot) -> Self {
        let mut tables: HashMap<String, BTreeSet<String>> = HashMap::new();
        for table in &snapshot.tables {
            tables
                .entry(table.name.to_lowercase())
                .or_default()
                .insert(table.schema.clone());
        }
        Self { tables }
    }

    /// Candidate schemas for a bare table name; the lookup is case-insensitive.
    pub fn schemas_for(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Valid labels of one enum-typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumColumn {
    /// `schema.table`
    pub table_key: String,
    pub column: String,
    pub values: Vec<String>,
}

/// `(schema.table, column)` -> enum labels, for enum-typed columns only.
#[derive(Debug, Clone, Default)]
pub struct EnumIndex {
    entries: Vec<EnumColumn>,
}

impl EnumIndex {
    pub fn build(snapshot: &SchemaSnapshot) -> Self {
        let entries = snapshot
            .tables
            .iter()
            .flat_map(|table| {
                let table_key = table.key();
                table.columns.iter().filter_map(move |col| {
                    col.enum_values.as_ref().map(|values| EnumColumn {
                        table_key: table_key.clone(),
                        column: col.name.clone(),
                        values: values.clone(),
                    })
                })
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, table_key: &str, column: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.table_key == table_key && e.column == column)
            .map(|e| e.values.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnumColumn> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
