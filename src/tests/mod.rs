// src/tests/mod.rs
//! End-to-end tests of the facade over real engines
