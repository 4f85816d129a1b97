//! Server side of the oldstyle NBD exchange: block sources and a read-only export loop.

pub mod block;
pub mod file;
pub mod pattern;
pub mod server;

pub use block::{BlockSource, BlockSourceError, BlockSourceErrorKind, BlockSourceResult};
pub use file::FileBlockSource;
pub use pattern::PatternBlockSource;
pub use server::{serve, serve_connection, MAX_REQUEST_BYTES};
