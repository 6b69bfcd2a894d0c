//! Shared bootstrap for the dipper binaries.

pub mod common;
