//! CSV tokenizer and escaping for the batch wire format
//!
//! Fields are separated by commas and lines end with a newline. A
//! quoted field may contain commas and newlines, with backslash
//! escaping of quotes and backslashes. An empty unquoted field is a
//! null value while `""` is the empty string.

use crate::error::{Error, Result};

/// One parsed line
pub type CsvRow = Vec<Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a field
    FieldStart,
    /// Inside an unquoted field
    Unquoted,
    /// Inside a quoted field
    Quoted,
    /// After a backslash inside a quoted field
    Escape,
    /// After the closing quote of a field
    AfterQuote,
}

/// Incremental tokenizer fed with arbitrary byte chunks
#[derive(Debug)]
pub struct CsvTokenizer {
    state: State,
    field: Vec<u8>,
    quoted: bool,
    fields: CsvRow,
    line_bytes: u64,
    line_number: u64,
}

impl Default for CsvTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvTokenizer {
    pub fn new() -> Self {
        Self {
            state: State::FieldStart,
            field: Vec::new(),
            quoted: false,
            fields: Vec::new(),
            line_bytes: 0,
            line_number: 0,
        }
    }

    /// Number of the line currently being read, starting at 1
    pub fn line_number(&self) -> u64 {
        self.line_number + 1
    }

    /// Feed a chunk, invoking `on_line` with each completed line, the
    /// line number and the bytes it occupied
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_line: F) -> Result<()>
    where
        F: FnMut(CsvRow, u64, u64) -> Result<()>,
    {
        for &byte in chunk {
            self.line_bytes += 1;
            match self.state {
                State::FieldStart => match byte {
                    b'"' => {
                        self.quoted = true;
                        self.state = State::Quoted;
                    }
                    b',' => self.end_field()?,
                    b'\n' => self.end_line(&mut on_line)?,
                    b'\r' => {}
                    _ => {
                        self.field.push(byte);
                        self.state = State::Unquoted;
                    }
                },
                State::Unquoted => match byte {
                    b',' => self.end_field()?,
                    b'\n' => self.end_line(&mut on_line)?,
                    b'\r' => {}
                    b'"' => {
                        return Err(Error::protocol(
                            self.line_number(),
                            "unexpected quote inside unquoted field",
                        ))
                    }
                    _ => self.field.push(byte),
                },
                State::Quoted => match byte {
                    b'\\' => self.state = State::Escape,
                    b'"' => self.state = State::AfterQuote,
                    _ => self.field.push(byte),
                },
                State::Escape => {
                    let decoded = match byte {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => other,
                    };
                    self.field.push(decoded);
                    self.state = State::Quoted;
                }
                State::AfterQuote => match byte {
                    b',' => self.end_field()?,
                    b'\n' => self.end_line(&mut on_line)?,
                    b'\r' => {}
                    other => {
                        return Err(Error::protocol(
                            self.line_number(),
                            format!("unexpected character '{}' after closing quote", other as char),
                        ))
                    }
                },
            }
        }
        Ok(())
    }

    /// Flush a trailing line without a newline.
    ///
    /// Fails when input ends inside a quoted field.
    pub fn finish<F>(&mut self, mut on_line: F) -> Result<()>
    where
        F: FnMut(CsvRow, u64, u64) -> Result<()>,
    {
        match self.state {
            State::Quoted | State::Escape => Err(Error::protocol(
                self.line_number(),
                "input ended inside a quoted field",
            )),
            State::FieldStart if self.fields.is_empty() => Ok(()),
            _ => self.end_line(&mut on_line),
        }
    }

    fn end_field(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.field);
        let value = if self.quoted || !bytes.is_empty() {
            let text = String::from_utf8(bytes).map_err(|e| {
                Error::protocol(self.line_number(), format!("invalid UTF-8 in field: {}", e))
            })?;
            Some(text)
        } else {
            None
        };
        self.fields.push(value);
        self.quoted = false;
        self.state = State::FieldStart;
        Ok(())
    }

    fn end_line<F>(&mut self, on_line: &mut F) -> Result<()>
    where
        F: FnMut(CsvRow, u64, u64) -> Result<()>,
    {
        let blank = self.fields.is_empty()
            && self.field.is_empty()
            && !self.quoted
            && self.state == State::FieldStart;
        if !blank {
            self.end_field()?;
        }
        self.line_number += 1;
        let bytes = std::mem::take(&mut self.line_bytes);
        let fields = std::mem::take(&mut self.fields);
        self.state = State::FieldStart;
        if blank {
            return Ok(());
        }
        on_line(fields, self.line_number, bytes)
    }
}

/// Parse a single CSV line such as captured row data
pub fn parse_line(text: &str) -> Result<CsvRow> {
    let mut tokenizer = CsvTokenizer::new();
    let mut rows = Vec::new();
    let mut collect = |row: CsvRow, _line: u64, _bytes: u64| {
        rows.push(row);
        Ok::<(), Error>(())
    };
    tokenizer.feed(text.as_bytes(), &mut collect)?;
    tokenizer.finish(&mut collect)?;
    Ok(rows.into_iter().flatten().collect())
}

/// Quote and escape one value; null becomes an empty field
pub fn escape(value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(text) => {
            let mut out = String::with_capacity(text.len() + 2);
            out.push('"');
            for c in text.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    _ => out.push(c),
                }
            }
            out.push('"');
            out
        }
    }
}

/// Escape and join a row of values
pub fn join_row(values: &[Option<String>]) -> String {
    values
        .iter()
        .map(|v| escape(v.as_deref()))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize_chunks(chunks: &[&[u8]]) -> Result<Vec<CsvRow>> {
        let mut tokenizer = CsvTokenizer::new();
        let mut rows = Vec::new();
        for chunk in chunks {
            tokenizer.feed(chunk, |row, _, _| {
                rows.push(row);
                Ok(())
            })?;
        }
        tokenizer.finish(|row, _, _| {
            rows.push(row);
            Ok(())
        })?;
        Ok(rows)
    }

    #[test]
    fn test_null_and_empty_are_distinct() {
        let row = parse_line(r#""a",,"""#).unwrap();
        assert_eq!(row, vec![Some("a".into()), None, Some(String::new())]);
    }

    #[test]
    fn test_trailing_comma_is_trailing_null() {
        let row = parse_line("insert,\"1\",").unwrap();
        assert_eq!(row, vec![Some("insert".into()), Some("1".into()), None]);
    }

    #[test]
    fn test_escape_round_trip() {
        let original = vec![
            Some("plain".to_string()),
            Some("comma, inside".to_string()),
            Some("quote \" inside".to_string()),
            Some("back\\slash".to_string()),
            Some("multi\nline".to_string()),
            None,
        ];
        let line = join_row(&original);
        assert_eq!(parse_line(&line).unwrap(), original);
    }

    #[test]
    fn test_chunk_boundaries_anywhere() {
        let text = "batch,1\ninsert,\"x,\\\"y\",\"\u{e9}t\u{e9}\"\ncommit,1\n";
        let bytes = text.as_bytes();
        let whole = tokenize_chunks(&[bytes]).unwrap();
        assert_eq!(whole.len(), 3);
        for split in 1..bytes.len() {
            let rows = tokenize_chunks(&[&bytes[..split], &bytes[split..]]).unwrap();
            assert_eq!(rows, whole, "split at {}", split);
        }
        assert_eq!(whole[1][1], Some("x,\"y".to_string()));
        assert_eq!(whole[1][2], Some("\u{e9}t\u{e9}".to_string()));
    }

    #[test]
    fn test_blank_lines_and_crlf_skipped() {
        let rows = tokenize_chunks(&[b"nodeid,001\r\n\r\nbatch,2\r\n"]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![Some("batch".into()), Some("2".into())]);
    }

    #[test]
    fn test_malformed_input_is_protocol_error() {
        assert!(matches!(
            parse_line("\"open"),
            Err(Error::Protocol { .. })
        ));
        assert!(matches!(
            parse_line("\"a\"b"),
            Err(Error::Protocol { .. })
        ));
        assert!(matches!(
            parse_line("ab\"c"),
            Err(Error::Protocol { .. })
        ));
    }
}
