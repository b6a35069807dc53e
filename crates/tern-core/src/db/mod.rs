//! libSQL persistence for the local record store

mod connection;
mod meta_repository;
mod migrations;
mod record_store;

pub use connection::Database;
pub use record_store::LibSqlLocalStore;
