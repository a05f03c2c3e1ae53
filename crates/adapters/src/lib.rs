//! External adapters for a Hashweave node
//!
//! Currently an HTTP service exposing the node's peers, statistics and
//! blocks, and accepting transactions.

pub mod http_server;

pub use http_server::{create_router, HttpServer, ServerConfig};
