//! Data writer contract and the protocol serializer

use std::collections::HashSet;
use std::io::Write;

use crate::error::{Error, Result};
use crate::io::csv::{escape, join_row, CsvRow};
use crate::io::data::{Batch, CsvData};
use crate::model::{DataEventType, Table};

/// Consumer of batch, table and row events
pub trait DataWriter {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_batch(&mut self, batch: &Batch) -> Result<()>;

    /// Returns false when rows for this table will be skipped
    fn start_table(&mut self, table: &Table) -> Result<bool>;

    fn write(&mut self, data: &CsvData) -> Result<()>;

    fn end_table(&mut self, table: &Table) -> Result<()>;

    fn end_batch(&mut self, batch: &Batch) -> Result<()>;

    /// Called instead of `end_batch` when reading the batch failed
    fn abort_batch(&mut self, _batch: &Batch, _error: &Error) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Serializes writer events into the CSV token grammar
pub struct ProtocolDataWriter<W: Write> {
    out: W,
    source_node_id: String,
    header_written: bool,
    tables_in_batch: HashSet<String>,
    last_catalog: Option<String>,
    last_schema: Option<String>,
    batch_bytes: u64,
    total_bytes: u64,
    rows_in_batch: u64,
}

impl<W: Write> ProtocolDataWriter<W> {
    pub fn new(source_node_id: impl Into<String>, out: W) -> Self {
        Self {
            out,
            source_node_id: source_node_id.into(),
            header_written: false,
            tables_in_batch: HashSet::new(),
            last_catalog: None,
            last_schema: None,
            batch_bytes: 0,
            total_bytes: 0,
            rows_in_batch: 0,
        }
    }

    /// Bytes written for the current (or last) batch
    pub fn batch_bytes(&self) -> u64 {
        self.batch_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Rows written for the current (or last) batch
    pub fn rows_in_batch(&self) -> u64 {
        self.rows_in_batch
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: String) -> Result<()> {
        self.out.write_all(line.as_bytes())?;
        let len = line.len() as u64;
        self.batch_bytes += len;
        self.total_bytes += len;
        Ok(())
    }

    fn println(&mut self, token: &str, rest: &str) -> Result<()> {
        if rest.is_empty() {
            self.write_line(format!("{}\n", token))
        } else {
            self.write_line(format!("{},{}\n", token, rest))
        }
    }

    fn println_row(&mut self, token: &str, row: &CsvRow) -> Result<()> {
        if row.is_empty() {
            self.write_line(format!("{}\n", token))
        } else {
            self.write_line(format!("{},{}\n", token, join_row(row)))
        }
    }

    fn println_names(&mut self, token: &str, names: &[String]) -> Result<()> {
        let joined = names.iter().map(|n| plain(n)).collect::<Vec<_>>().join(",");
        self.println(token, &joined)
    }
}

/// Envelope values go unquoted unless they contain separators
fn plain(value: &str) -> String {
    if value.is_empty() || value.contains([',', '"', '\\', '\n', '\r']) {
        escape(Some(value))
    } else {
        value.to_string()
    }
}

impl<W: Write> DataWriter for ProtocolDataWriter<W> {
    fn start_batch(&mut self, batch: &Batch) -> Result<()> {
        if !self.header_written {
            let node_id = plain(&self.source_node_id);
            self.println("nodeid", &node_id)?;
            self.println("binary", batch.binary_encoding.name())?;
            self.header_written = true;
        }
        self.batch_bytes = 0;
        self.rows_in_batch = 0;
        self.tables_in_batch.clear();
        self.println("channel", &plain(&batch.channel_id))?;
        self.println("batch", &batch.batch_id.to_string())?;
        if batch.ignored {
            self.println("ignore", "")?;
        }
        Ok(())
    }

    fn start_table(&mut self, table: &Table) -> Result<bool> {
        if self.last_catalog != table.catalog {
            let catalog = table.catalog.as_deref().map(plain).unwrap_or_default();
            self.println("catalog", &catalog)?;
            self.last_catalog = table.catalog.clone();
        }
        if self.last_schema != table.schema {
            let schema = table.schema.as_deref().map(plain).unwrap_or_default();
            self.println("schema", &schema)?;
            self.last_schema = table.schema.clone();
        }
        self.println("table", &plain(&table.name))?;
        if self.tables_in_batch.insert(table.fully_qualified_name()) {
            self.println_names("keys", &table.primary_key_names())?;
            self.println_names("columns", &table.column_names())?;
        }
        Ok(true)
    }

    fn write(&mut self, data: &CsvData) -> Result<()> {
        if let Some(old) = &data.old_data {
            if data.event_type == DataEventType::Update || data.event_type == DataEventType::Delete {
                self.println_row("old", old)?;
            }
        }
        let empty = Vec::new();
        match data.event_type {
            DataEventType::Insert => {
                self.println_row("insert", data.row_data.as_ref().unwrap_or(&empty))?;
            }
            DataEventType::Update => {
                let mut values = data.row_data.clone().unwrap_or_default();
                values.extend(data.pk_data.iter().flatten().cloned());
                self.println_row("update", &values)?;
            }
            DataEventType::Delete => {
                self.println_row("delete", data.pk_data.as_ref().unwrap_or(&empty))?;
            }
            DataEventType::Sql => {
                self.println("sql", &escape(data.text_value()))?;
            }
            DataEventType::Create => {
                self.println("create", &escape(data.text_value()))?;
            }
            DataEventType::Bsh => {
                self.println("bsh", &escape(data.text_value()))?;
            }
            DataEventType::Reload => {
                return Err(Error::Internal(
                    "reload events are expanded before they reach the protocol writer".into(),
                ));
            }
        }
        self.rows_in_batch += 1;
        Ok(())
    }

    fn end_table(&mut self, _table: &Table) -> Result<()> {
        Ok(())
    }

    fn end_batch(&mut self, batch: &Batch) -> Result<()> {
        self.println("commit", &batch.batch_id.to_string())?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;

    #[test]
    fn test_writes_token_grammar() {
        let table = Table::new("t1").with_columns(vec![
            Column::new("a", "INTEGER").primary_key(),
            Column::new("b", "TEXT"),
        ]);
        let batch = Batch::new(12, "001", "sales");

        let mut writer = ProtocolDataWriter::new("001", Vec::new());
        writer.start_batch(&batch).unwrap();
        writer.start_table(&table).unwrap();
        writer
            .write(&CsvData::insert(vec![Some("1".into()), Some("x, \"y\"".into())]))
            .unwrap();
        writer
            .write(&CsvData::delete(vec![Some("1".into())]).with_old(Some(vec![
                Some("1".into()),
                None,
            ])))
            .unwrap();
        writer.end_table(&table).unwrap();
        writer.end_batch(&batch).unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let expected = "nodeid,001\n\
                        binary,HEX\n\
                        channel,sales\n\
                        batch,12\n\
                        table,t1\n\
                        keys,a\n\
                        columns,a,b\n\
                        insert,\"1\",\"x, \\\"y\\\"\"\n\
                        old,\"1\",\n\
                        delete,\"1\"\n\
                        commit,12\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_table_metadata_written_once_per_batch() {
        let table = Table::new("t1").with_columns(vec![Column::new("a", "INTEGER").primary_key()]);
        let mut writer = ProtocolDataWriter::new("001", Vec::new());
        let batch = Batch::new(1, "001", "default");
        writer.start_batch(&batch).unwrap();
        writer.start_table(&table).unwrap();
        writer.start_table(&table).unwrap();
        writer.end_batch(&batch).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text.matches("columns,").count(), 1);
        assert_eq!(text.matches("table,").count(), 2);
    }
}
