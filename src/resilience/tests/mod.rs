// src/resilience/tests/mod.rs
//! Tests for resilience features

mod exponential_backoff_tests;
mod guarded_storage_tests;
