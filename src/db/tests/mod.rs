//! Tests for the database facade.

mod helpers;
mod tests_encryption;
mod tests_keys;
mod tests_recovery;
