// Tidemark Kernel
//
// Write and recovery core of a file-based table format: the instant
// timeline, per-file write markers, base and log file writers, rollback
// and the write client that ties them together.

pub mod bloom;
pub mod client;
pub mod config;
pub mod executor;
pub mod fs;
pub mod invariants;
pub mod io;
pub mod markers;
pub mod record;
pub mod replay;
pub mod rollback;
pub mod schema;
pub mod state;
pub mod table;
pub mod timeline;
