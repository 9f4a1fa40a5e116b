//! HTTP API Module
//!
//! Serves the sync protocol to remote nodes and a REST API for operators.

mod http;

pub use http::HttpServer;
