//! Database Module
//!
//! SQLite storage for the sym_ runtime tables, table introspection and
//! the trigger dialect that installs change capture.

pub mod dialect;
pub mod platform;
pub mod schema;
pub mod sqlite;
pub mod template;

pub use dialect::Dialect;
pub use platform::Platform;
pub use sqlite::{SqliteDialect, SqliteTriggerTemplate};
pub use template::TriggerTemplate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;

/// Run `f` in an immediate transaction, committing when it succeeds and
/// rolling back when it fails
pub fn in_transaction<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Node database: one SQLite connection shared by every service
pub struct Database {
    /// Database connection
    conn: Mutex<Connection>,
    /// File backing the database, `None` for in-memory databases
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file and install the sym_ tables
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Journal mode {}", mode);
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        schema::create_sym_tables(&conn)?;

        tracing::debug!("Opened database at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database with the sym_ tables installed
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_sym_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Wrap a connection that already has the sym_ tables
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            path: None,
        }
    }

    /// Lock the connection.
    ///
    /// Statements and transactions must not be held across an await point.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Install any missing sym_ tables
    pub async fn create_sym_tables(&self) -> Result<()> {
        let conn = self.lock().await;
        schema::create_sym_tables(&conn)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
