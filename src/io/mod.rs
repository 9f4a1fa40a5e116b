//! Batch I/O Module
//!
//! The CSV token protocol that carries batches between nodes, and the
//! writers that consume it.

pub mod csv;
pub mod data;
pub mod database_writer;
pub mod reader;
pub mod writer;

pub use data::{Batch, BinaryEncoding, CsvData};
pub use database_writer::{DatabaseWriterSettings, DefaultDatabaseWriter};
pub use reader::{ProtocolDataReader, ReadSummary};
pub use writer::{DataWriter, ProtocolDataWriter};
