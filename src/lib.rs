//! SymSync - Trigger-based change capture and batch replication
//!
//! A SymmetricDS-compatible sync client for SQLite. Database triggers
//! capture row changes into `sym_data`, the router groups them into
//! per-node outgoing batches, and the batches travel to other nodes in
//! the CSV batch protocol where they are loaded and acknowledged.
//!
//! # Architecture
//!
//! Services operate on a borrowed SQLite connection so several calls can
//! share one transaction. The [`engine::SyncEngine`] wires them to a
//! transport and runs the sync-triggers, route, push and pull jobs.
//!
//! # Features
//!
//! - Trigger generation from a deterministic template, rebuilt when a
//!   table or trigger definition changes
//! - Default and column-match routers
//! - Batch extraction, loading with insert/update fallbacks, and acks
//! - HTTP and in-process transports
//! - Operator HTTP API

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod io;
pub mod model;
pub mod service;
pub mod transport;

pub use config::SyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::db::Database;
    pub use crate::engine::{Job, SyncEngine};
    pub use crate::error::{Error, Result};
    pub use crate::model::{
        BatchAck, IncomingBatch, IncomingBatchStatus, Node, OutgoingBatch, OutgoingBatchStatus,
        RemoteNodeStatus, RemoteStatus,
    };
    pub use crate::transport::{
        Credentials, HttpTransportManager, InternalTransportManager, SyncEndpoint, TransportManager,
    };
}
