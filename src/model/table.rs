//! Table and column definitions

use serde::{Deserialize, Serialize};

/// Value family of a column, derived from its declared SQL type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Numeric,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    /// A declared type with no known value family
    Other(String),
}

impl ColumnType {
    /// Classify a declared SQL type name.
    ///
    /// Follows SQLite's affinity rules for the common families and
    /// separates out temporal and boolean declarations. A column
    /// declared without a type holds text.
    pub fn from_declared(type_name: &str) -> Self {
        let upper = type_name.trim().to_uppercase();
        if upper.is_empty() {
            return ColumnType::Text;
        }
        if upper.contains("BOOL") || upper == "BIT" {
            ColumnType::Boolean
        } else if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
            ColumnType::Timestamp
        } else if upper.contains("DATE") {
            ColumnType::Date
        } else if upper.contains("TIME") {
            ColumnType::Time
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("CHAR")
            || upper.contains("CLOB")
            || upper.contains("TEXT")
            || upper.contains("JSON")
            || upper.contains("UUID")
        {
            ColumnType::Text
        } else if upper.contains("BLOB") || upper.contains("BINARY") {
            ColumnType::Binary
        } else if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUMERIC")
            || upper.contains("DECIMAL")
            || upper.contains("NUMBER")
        {
            ColumnType::Numeric
        } else {
            ColumnType::Other(type_name.to_string())
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ColumnType::Binary)
    }
}

/// A table column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared SQL type as reported by the database
    pub type_name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub required: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            column_type: ColumnType::from_declared(&type_name),
            type_name,
            primary_key: false,
            required: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A database table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_qualifiers(
        catalog: Option<String>,
        schema: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            catalog: blank_to_none(catalog),
            schema: blank_to_none(schema),
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    /// Build a table from column name lists, as carried by trigger
    /// history or the wire protocol. Types are unknown and treated as text.
    pub fn from_names(
        catalog: Option<String>,
        schema: Option<String>,
        name: impl Into<String>,
        column_names: &[String],
        pk_names: &[String],
    ) -> Self {
        let columns = column_names
            .iter()
            .map(|c| {
                let column = Column::new(c.clone(), "");
                if pk_names.iter().any(|pk| pk.eq_ignore_ascii_case(c)) {
                    column.primary_key()
                } else {
                    column
                }
            })
            .collect();
        Self::with_qualifiers(catalog, schema, name).with_columns(columns)
    }

    /// Catalog, schema and table name joined with dots
    pub fn fully_qualified_name(&self) -> String {
        fully_qualified_name(self.catalog.as_deref(), self.schema.as_deref(), &self.name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key_columns()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// Find a column by name, ignoring case
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Stable hash over the table's shape
    pub fn calculate_table_hash(&self) -> i64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.name.to_lowercase().as_bytes());
        for column in &self.columns {
            hasher.update(b"|");
            hasher.update(column.name.to_lowercase().as_bytes());
            hasher.update(b":");
            hasher.update(column.type_name.to_uppercase().as_bytes());
            hasher.update(if column.primary_key { b":1" } else { b":0" });
        }
        hasher.finalize() as i64
    }
}

/// Join non-blank qualifiers and the table name with dots
pub fn fully_qualified_name(catalog: Option<&str>, schema: Option<&str>, name: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(c) = catalog.filter(|c| !c.trim().is_empty()) {
        parts.push(c);
    }
    if let Some(s) = schema.filter(|s| !s.trim().is_empty()) {
        parts.push(s);
    }
    parts.push(name);
    parts.join(".")
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
