//! Common test utilities shared across the `riff-discover` integration tests.
//!
//! Declared with `mod common;` inside each test file that needs it.

pub mod fake_probe;
