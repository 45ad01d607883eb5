//! Tests for the write-ahead log.
//!
//! Disk state lives in `tempfile::TempDir`s; corruption tests flip bytes
//! in the log file directly.

mod helpers;
mod tests_rotation;
