//! Durable sequences backed by sym_sequence

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::now_timestamp;

/// Sequence issuing outgoing batch ids
pub const OUTGOING_BATCH: &str = "outgoing_batch";

const MAX_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy)]
struct SequenceRow {
    current_value: i64,
    increment_by: i64,
    min_value: i64,
    max_value: i64,
    cycle: bool,
}

#[derive(Debug, Default)]
pub struct SequenceService;

impl SequenceService {
    pub fn new() -> Self {
        Self
    }

    /// Create the built-in sequences if they are missing
    pub fn init(&self, conn: &Connection) -> Result<()> {
        self.create(conn, OUTGOING_BATCH, 0)
    }

    pub fn create(&self, conn: &Connection, name: &str, initial_value: i64) -> Result<()> {
        conn.execute(
            r#"
            INSERT OR IGNORE INTO sym_sequence (sequence_name, current_value, increment_by,
                min_value, max_value, cycle, create_time, last_update_by, last_update_time)
            VALUES (?1, ?2, 1, 1, 9999999999, 0, ?3, 'symsync', ?3)
            "#,
            params![name, initial_value, now_timestamp()],
        )?;
        Ok(())
    }

    /// Issue the next value.
    ///
    /// Reads the current value and conditionally writes the next one,
    /// retrying when another writer got there first.
    pub fn next_val(&self, conn: &Connection, name: &str) -> Result<i64> {
        for _ in 0..MAX_ATTEMPTS {
            let row = self
                .read(conn, name)?
                .ok_or_else(|| Error::NotFound(format!("sequence {}", name)))?;

            let mut next = row.current_value + row.increment_by;
            if next > row.max_value {
                if row.cycle {
                    next = row.min_value;
                } else {
                    return Err(Error::Internal(format!(
                        "sequence {} exceeded its maximum value {}",
                        name, row.max_value
                    )));
                }
            }

            let updated = conn.execute(
                r#"
                UPDATE sym_sequence SET current_value = ?1, last_update_time = ?2
                WHERE sequence_name = ?3 AND current_value = ?4
                "#,
                params![next, now_timestamp(), name, row.current_value],
            )?;
            if updated == 1 {
                return Ok(next);
            }
            debug!("Sequence {} moved concurrently, retrying", name);
        }
        Err(Error::Internal(format!(
            "could not allocate a value from sequence {}",
            name
        )))
    }

    /// Last issued value
    pub fn current_val(&self, conn: &Connection, name: &str) -> Result<i64> {
        self.read(conn, name)?
            .map(|row| row.current_value)
            .ok_or_else(|| Error::NotFound(format!("sequence {}", name)))
    }

    fn read(&self, conn: &Connection, name: &str) -> Result<Option<SequenceRow>> {
        let row = conn
            .query_row(
                r#"
                SELECT current_value, increment_by, min_value, max_value, cycle
                FROM sym_sequence WHERE sequence_name = ?1
                "#,
                params![name],
                |row| {
                    Ok(SequenceRow {
                        current_value: row.get(0)?,
                        increment_by: row.get(1)?,
                        min_value: row.get(2)?,
                        max_value: row.get(3)?,
                        cycle: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::create_sym_tables;

    #[test]
    fn test_next_val_increments() {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let sequences = SequenceService::new();
        sequences.init(&conn).unwrap();
        sequences.init(&conn).unwrap();

        assert_eq!(sequences.next_val(&conn, OUTGOING_BATCH).unwrap(), 1);
        assert_eq!(sequences.next_val(&conn, OUTGOING_BATCH).unwrap(), 2);
        assert_eq!(sequences.current_val(&conn, OUTGOING_BATCH).unwrap(), 2);
    }

    #[test]
    fn test_cycle_and_overflow() {
        let conn = Connection::open_in_memory().unwrap();
        create_sym_tables(&conn).unwrap();
        let sequences = SequenceService::new();
        sequences.create(&conn, "small", 0).unwrap();
        conn.execute(
            "UPDATE sym_sequence SET max_value = 2 WHERE sequence_name = 'small'",
            [],
        )
        .unwrap();
        assert_eq!(sequences.next_val(&conn, "small").unwrap(), 1);
        assert_eq!(sequences.next_val(&conn, "small").unwrap(), 2);
        assert!(sequences.next_val(&conn, "small").is_err());

        conn.execute("UPDATE sym_sequence SET cycle = 1 WHERE sequence_name = 'small'", [])
            .unwrap();
        assert_eq!(sequences.next_val(&conn, "small").unwrap(), 1);
        assert!(matches!(
            sequences.next_val(&conn, "missing"),
            Err(Error::NotFound(_))
        ));
    }
}
