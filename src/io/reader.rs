//! Streaming protocol reader
//!
//! Bytes are pushed into the reader as they arrive. Each completed line
//! is dispatched on its leading token and drives a [`DataWriter`].

use std::collections::{HashMap, HashSet};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::io::csv::{CsvRow, CsvTokenizer};
use crate::io::data::{Batch, BinaryEncoding, CsvData};
use crate::io::writer::DataWriter;
use crate::model::{table::fully_qualified_name, Column, Table};

/// Counters for one read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub batches_read: u64,
    pub rows_read: u64,
    pub lines_read: u64,
}

/// Parses the CSV token grammar into writer events
pub struct ProtocolDataReader {
    tokenizer: CsvTokenizer,
    source_node_id: Option<String>,
    channel_id: Option<String>,
    binary_encoding: BinaryEncoding,
    catalog: Option<String>,
    schema: Option<String>,
    batch: Option<Batch>,
    /// Tables described so far in the current batch, by qualified name
    tables: HashMap<String, Table>,
    current_table: Option<Table>,
    pending_keys: HashSet<String>,
    /// Table the writer was last told to start
    started_table: Option<Table>,
    table_pending: bool,
    old_data: Option<CsvRow>,
    failed: bool,
    summary: ReadSummary,
}

impl Default for ProtocolDataReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolDataReader {
    pub fn new() -> Self {
        Self {
            tokenizer: CsvTokenizer::new(),
            source_node_id: None,
            channel_id: None,
            binary_encoding: BinaryEncoding::default(),
            catalog: None,
            schema: None,
            batch: None,
            tables: HashMap::new(),
            current_table: None,
            pending_keys: HashSet::new(),
            started_table: None,
            table_pending: false,
            old_data: None,
            failed: false,
            summary: ReadSummary::default(),
        }
    }

    /// Node id announced by the stream's `nodeid` line
    pub fn source_node_id(&self) -> Option<&str> {
        self.source_node_id.as_deref()
    }

    pub fn summary(&self) -> &ReadSummary {
        &self.summary
    }

    /// Batch currently being read, if any
    pub fn current_batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    /// Feed the next chunk of the stream.
    ///
    /// An error aborts the batch being read; batches already ended are
    /// unaffected. After an error the reader accepts no more input.
    pub fn feed<W: DataWriter + ?Sized>(&mut self, chunk: &[u8], writer: &mut W) -> Result<()> {
        if self.failed {
            return Err(Error::Internal("reader already failed".into()));
        }
        let mut tokenizer = std::mem::take(&mut self.tokenizer);
        let result = tokenizer.feed(chunk, |tokens, line, bytes| {
            self.dispatch(tokens, line, bytes, &mut *writer)
        });
        self.tokenizer = tokenizer;
        result.map_err(|e| self.fail(e, writer))
    }

    /// Signal end of stream
    pub fn finish<W: DataWriter + ?Sized>(&mut self, writer: &mut W) -> Result<ReadSummary> {
        if self.failed {
            return Err(Error::Internal("reader already failed".into()));
        }
        let mut tokenizer = std::mem::take(&mut self.tokenizer);
        let result = tokenizer.finish(|tokens, line, bytes| {
            self.dispatch(tokens, line, bytes, &mut *writer)
        });
        self.tokenizer = tokenizer;
        result.map_err(|e| self.fail(e, writer))?;

        if let Some(batch) = &self.batch {
            let error = Error::protocol(
                self.summary.lines_read,
                format!("stream ended before batch {} was committed", batch.batch_id),
            );
            return Err(self.fail(error, writer));
        }
        Ok(self.summary.clone())
    }

    fn fail<W: DataWriter + ?Sized>(&mut self, error: Error, writer: &mut W) -> Error {
        self.failed = true;
        if let Some(batch) = self.batch.take() {
            error!("Failed to read batch {}: {}", batch.node_batch_id(), error);
            if let Err(e) = writer.abort_batch(&batch, &error) {
                error!("Failed to abort batch {}: {}", batch.node_batch_id(), e);
            }
        }
        error
    }

    fn dispatch<W: DataWriter + ?Sized>(
        &mut self,
        tokens: CsvRow,
        line: u64,
        bytes: u64,
        writer: &mut W,
    ) -> Result<()> {
        self.summary.lines_read += 1;
        if let Some(batch) = self.batch.as_mut() {
            batch.byte_count += bytes;
        }

        let mut tokens = tokens.into_iter();
        let token = match tokens.next().flatten() {
            Some(token) => token,
            None => return Err(Error::protocol(line, "line has no leading token")),
        };
        let values: CsvRow = tokens.collect();

        match token.as_str() {
            "nodeid" => self.source_node_id = first(&values),
            "binary" => {
                let name = first(&values).unwrap_or_default();
                self.binary_encoding = BinaryEncoding::from_name(&name).ok_or_else(|| {
                    Error::protocol(line, format!("unsupported binary encoding '{}'", name))
                })?;
            }
            "channel" => self.channel_id = first(&values),
            "catalog" => self.catalog = first(&values).filter(|v| !v.trim().is_empty()),
            "schema" => self.schema = first(&values).filter(|v| !v.trim().is_empty()),
            "batch" => self.start_batch(&values, line, writer)?,
            "ignore" => {
                if let Some(batch) = self.batch.as_mut() {
                    batch.ignored = true;
                }
            }
            "table" => self.select_table(&values, line)?,
            "keys" => {
                self.pending_keys = values.into_iter().flatten().collect();
                if let Some(table) = self.current_table.as_mut() {
                    for column in table.columns.iter_mut() {
                        column.primary_key = self.pending_keys.contains(&column.name);
                    }
                }
            }
            "columns" => self.set_columns(values, line)?,
            "insert" => {
                let data = CsvData::insert(values).with_old(self.old_data.take());
                self.write_row(data, line, writer)?;
            }
            "update" => {
                let column_count = self.table_for_rows(line)?.columns.len();
                if values.len() <= column_count {
                    return Err(Error::protocol(
                        line,
                        format!(
                            "update carries {} values but table has {} columns and needs key values",
                            values.len(),
                            column_count
                        ),
                    ));
                }
                let mut row = values;
                let pk = row.split_off(column_count);
                let data = CsvData::update(row, pk).with_old(self.old_data.take());
                self.write_row(data, line, writer)?;
            }
            "delete" => {
                let data = CsvData::delete(values).with_old(self.old_data.take());
                self.write_row(data, line, writer)?;
            }
            "old" => self.old_data = Some(values),
            "sql" => {
                let data = CsvData::sql(first(&values).unwrap_or_default());
                self.write_row(data, line, writer)?;
            }
            "create" => {
                let data = CsvData::create(first(&values).unwrap_or_default());
                self.write_row(data, line, writer)?;
            }
            "bsh" => {
                let data = CsvData::bsh(first(&values).unwrap_or_default());
                self.write_row(data, line, writer)?;
            }
            "commit" => self.end_batch(line, writer)?,
            other => {
                debug!("Ignoring unknown protocol token '{}' at line {}", other, line);
            }
        }
        Ok(())
    }

    fn start_batch<W: DataWriter + ?Sized>(
        &mut self,
        values: &CsvRow,
        line: u64,
        writer: &mut W,
    ) -> Result<()> {
        if let Some(open) = &self.batch {
            return Err(Error::protocol(
                line,
                format!("batch started before batch {} was committed", open.batch_id),
            ));
        }
        let batch_id = first(values)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| Error::protocol(line, "batch line needs a numeric batch id"))?;
        let source_node_id = self
            .source_node_id
            .clone()
            .ok_or_else(|| Error::protocol(line, "batch started before nodeid"))?;

        let mut batch = Batch::new(
            batch_id,
            source_node_id,
            self.channel_id.clone().unwrap_or_else(|| "default".to_string()),
        );
        batch.binary_encoding = self.binary_encoding;
        self.tables.clear();
        self.current_table = None;
        self.started_table = None;
        self.table_pending = false;
        self.old_data = None;

        writer.start_batch(&batch)?;
        self.summary.batches_read += 1;
        self.batch = Some(batch);
        Ok(())
    }

    fn select_table(&mut self, values: &CsvRow, line: u64) -> Result<()> {
        let name = first(values)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::protocol(line, "table line needs a table name"))?;
        let key = fully_qualified_name(self.catalog.as_deref(), self.schema.as_deref(), &name);
        let table = match self.tables.get(&key) {
            Some(known) => known.clone(),
            None => Table::with_qualifiers(self.catalog.clone(), self.schema.clone(), name),
        };
        self.pending_keys.clear();
        self.current_table = Some(table);
        self.table_pending = true;
        Ok(())
    }

    fn set_columns(&mut self, values: CsvRow, line: u64) -> Result<()> {
        let table = self
            .current_table
            .as_mut()
            .ok_or_else(|| Error::protocol(line, "columns line before table line"))?;
        table.columns = values
            .into_iter()
            .flatten()
            .map(|name| {
                let column = Column::new(name.clone(), "");
                if self.pending_keys.contains(&name) {
                    column.primary_key()
                } else {
                    column
                }
            })
            .collect();
        self.tables.insert(table.fully_qualified_name(), table.clone());
        Ok(())
    }

    fn table_for_rows(&self, line: u64) -> Result<&Table> {
        self.current_table
            .as_ref()
            .ok_or_else(|| Error::protocol(line, "row data before table line"))
    }

    fn write_row<W: DataWriter + ?Sized>(
        &mut self,
        data: CsvData,
        line: u64,
        writer: &mut W,
    ) -> Result<()> {
        let ignored = match &self.batch {
            Some(batch) => batch.ignored,
            None => return Err(Error::protocol(line, "row data outside of a batch")),
        };
        self.summary.rows_read += 1;
        if ignored {
            return Ok(());
        }

        let needs_table = data.event_type.is_dml();
        if self.table_pending {
            let table = self.table_for_rows(line)?.clone();
            if let Some(previous) = self.started_table.take() {
                writer.end_table(&previous)?;
            }
            writer.start_table(&table)?;
            self.started_table = Some(table);
            self.table_pending = false;
        } else if needs_table && self.started_table.is_none() {
            return Err(Error::protocol(line, "row data before table line"));
        }

        writer.write(&data)
    }

    fn end_batch<W: DataWriter + ?Sized>(&mut self, line: u64, writer: &mut W) -> Result<()> {
        let batch = match self.batch.take() {
            Some(batch) => batch,
            None => {
                debug!("Ignoring commit outside of a batch at line {}", line);
                return Ok(());
            }
        };
        if let Some(table) = self.started_table.take() {
            if let Err(e) = writer.end_table(&table) {
                self.batch = Some(batch);
                return Err(e);
            }
        }
        self.table_pending = false;
        if let Err(e) = writer.end_batch(&batch) {
            self.batch = Some(batch);
            return Err(e);
        }
        Ok(())
    }
}

fn first(values: &CsvRow) -> Option<String> {
    values.first().cloned().flatten()
}
