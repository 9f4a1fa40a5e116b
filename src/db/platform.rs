//! Table introspection with a per-name cache

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::model::table::fully_qualified_name;
use crate::model::{Column, Table};

/// Reads table definitions from the database
#[derive(Debug, Default)]
pub struct Platform {
    tables: Mutex<HashMap<String, Table>>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a table, returning `None` when it does not exist.
    ///
    /// The catalog is ignored by SQLite; the schema names an attached
    /// database such as `main`.
    pub fn get_table(
        &self,
        conn: &Connection,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        use_cache: bool,
    ) -> Result<Option<Table>> {
        let key = cache_key(catalog, schema, name);
        if use_cache {
            if let Some(table) = self.cache()?.get(&key) {
                return Ok(Some(table.clone()));
            }
        }

        let table = read_table(conn, catalog, schema, name)?;
        if let Some(table) = &table {
            self.cache()?.insert(key, table.clone());
        }
        Ok(table)
    }

    /// Forget the cached definition of one table
    pub fn reset_cache_for_table(&self, catalog: Option<&str>, schema: Option<&str>, name: &str) {
        if let Ok(mut cache) = self.tables.lock() {
            cache.remove(&cache_key(catalog, schema, name));
        }
    }

    /// Forget every cached table definition
    pub fn reset_cache(&self) {
        if let Ok(mut cache) = self.tables.lock() {
            cache.clear();
        }
    }

    /// Names of the user tables in the main database
    pub fn table_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Table>>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal("table cache lock poisoned".into()))
    }
}

fn cache_key(catalog: Option<&str>, schema: Option<&str>, name: &str) -> String {
    fully_qualified_name(catalog, schema, name).to_lowercase()
}

fn read_table(
    conn: &Connection,
    catalog: Option<&str>,
    schema: Option<&str>,
    name: &str,
) -> Result<Option<Table>> {
    let schema = schema.filter(|s| !s.trim().is_empty());
    let mut stmt = conn.prepare_cached(
        r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1, ?2) ORDER BY cid"#,
    )?;
    let columns = stmt
        .query_map(params![name, schema.unwrap_or("main")], |row| {
            let column_name: String = row.get(0)?;
            let type_name: String = row.get(1)?;
            let not_null: bool = row.get(2)?;
            let pk: i64 = row.get(3)?;
            let mut column = Column::new(column_name, type_name);
            if not_null {
                column = column.required();
            }
            if pk > 0 {
                column = column.primary_key();
            }
            Ok(column)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Ok(None);
    }

    // Report the table name the way it was declared
    let declared: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![name],
            |row| row.get(0),
        )
        .ok();

    Ok(Some(
        Table::with_qualifiers(
            catalog.map(str::to_string),
            schema.map(str::to_string),
            declared.unwrap_or_else(|| name.to_string()),
        )
        .with_columns(columns),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnType;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE Item (id INTEGER PRIMARY KEY, name VARCHAR(50) NOT NULL, price DECIMAL(10,2), photo BLOB);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_reads_columns_in_order() {
        let conn = setup();
        let platform = Platform::new();
        let table = platform
            .get_table(&conn, None, None, "item", true)
            .unwrap()
            .unwrap();
        assert_eq!(table.name, "Item");
        assert_eq!(table.column_names(), vec!["id", "name", "price", "photo"]);
        assert_eq!(table.primary_key_names(), vec!["id"]);
        assert!(table.columns[1].required);
        assert_eq!(table.columns[2].column_type, ColumnType::Numeric);
        assert_eq!(table.columns[3].column_type, ColumnType::Binary);
    }

    #[test]
    fn test_missing_table_is_none() {
        let conn = setup();
        let platform = Platform::new();
        assert!(platform
            .get_table(&conn, None, None, "nope", true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cache_until_reset() {
        let conn = setup();
        let platform = Platform::new();
        platform.get_table(&conn, None, None, "item", true).unwrap();
        conn.execute_batch("ALTER TABLE Item ADD COLUMN note TEXT;").unwrap();

        let cached = platform.get_table(&conn, None, None, "item", true).unwrap().unwrap();
        assert_eq!(cached.columns.len(), 4);

        platform.reset_cache_for_table(None, None, "ITEM");
        let fresh = platform.get_table(&conn, None, None, "item", true).unwrap().unwrap();
        assert_eq!(fresh.columns.len(), 5);
    }
}
