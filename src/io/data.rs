//! Batch envelope and row events carried by the wire protocol

use base64::Engine as _;

use crate::error::{Error, Result};
use crate::io::csv::CsvRow;
use crate::model::DataEventType;

/// Encoding of binary column values on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryEncoding {
    #[default]
    Hex,
    Base64,
    None,
}

impl BinaryEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryEncoding::Hex => "HEX",
            BinaryEncoding::Base64 => "BASE64",
            BinaryEncoding::None => "NONE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "HEX" => Some(BinaryEncoding::Hex),
            "BASE64" => Some(BinaryEncoding::Base64),
            "NONE" => Some(BinaryEncoding::None),
            _ => None,
        }
    }

    /// Decode a binary column value
    pub fn decode(&self, value: &str) -> Result<Vec<u8>> {
        match self {
            BinaryEncoding::Hex => hex::decode(value)
                .map_err(|e| Error::Internal(format!("invalid hex value: {}", e))),
            BinaryEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(value)
                .map_err(|e| Error::Internal(format!("invalid base64 value: {}", e))),
            BinaryEncoding::None => Ok(value.as_bytes().to_vec()),
        }
    }
}

/// Envelope of one batch on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: i64,
    pub source_node_id: String,
    pub channel_id: String,
    pub binary_encoding: BinaryEncoding,
    /// Set by an `ignore` line; rows are read but not applied
    pub ignored: bool,
    /// Bytes read or written for this batch
    pub byte_count: u64,
}

impl Batch {
    pub fn new(
        batch_id: i64,
        source_node_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            source_node_id: source_node_id.into(),
            channel_id: channel_id.into(),
            binary_encoding: BinaryEncoding::default(),
            ignored: false,
            byte_count: 0,
        }
    }

    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.source_node_id, self.batch_id)
    }
}

/// One row event: the values of a DML line, or the text of a sql/create line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvData {
    pub event_type: DataEventType,
    pub row_data: Option<CsvRow>,
    pub pk_data: Option<CsvRow>,
    pub old_data: Option<CsvRow>,
}

impl CsvData {
    pub fn insert(row: CsvRow) -> Self {
        Self {
            event_type: DataEventType::Insert,
            row_data: Some(row),
            pk_data: None,
            old_data: None,
        }
    }

    pub fn update(row: CsvRow, pk: CsvRow) -> Self {
        Self {
            event_type: DataEventType::Update,
            row_data: Some(row),
            pk_data: Some(pk),
            old_data: None,
        }
    }

    pub fn delete(pk: CsvRow) -> Self {
        Self {
            event_type: DataEventType::Delete,
            row_data: None,
            pk_data: Some(pk),
            old_data: None,
        }
    }

    pub fn sql(sql: impl Into<String>) -> Self {
        Self::text(DataEventType::Sql, sql.into())
    }

    pub fn create(ddl: impl Into<String>) -> Self {
        Self::text(DataEventType::Create, ddl.into())
    }

    pub fn bsh(script: impl Into<String>) -> Self {
        Self::text(DataEventType::Bsh, script.into())
    }

    fn text(event_type: DataEventType, text: String) -> Self {
        Self {
            event_type,
            row_data: Some(vec![Some(text)]),
            pk_data: None,
            old_data: None,
        }
    }

    pub fn with_old(mut self, old: Option<CsvRow>) -> Self {
        self.old_data = old;
        self
    }

    /// Text of a sql, create or bsh event
    pub fn text_value(&self) -> Option<&str> {
        self.row_data
            .as_ref()
            .and_then(|row| row.first())
            .and_then(|v| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_decoding() {
        assert_eq!(BinaryEncoding::Hex.decode("48690a").unwrap(), b"Hi\n");
        assert_eq!(BinaryEncoding::Base64.decode("SGkK").unwrap(), b"Hi\n");
        assert!(BinaryEncoding::Hex.decode("zz").is_err());
        assert_eq!(BinaryEncoding::from_name("base64"), Some(BinaryEncoding::Base64));
        assert_eq!(BinaryEncoding::from_name("rot13"), None);
    }

    #[test]
    fn test_text_events() {
        let sql = CsvData::sql("delete from item");
        assert_eq!(sql.event_type, DataEventType::Sql);
        assert_eq!(sql.text_value(), Some("delete from item"));
    }
}
