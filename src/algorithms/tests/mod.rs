// src/algorithms/tests/mod.rs

/// Tests for Fixed Window algorithm
mod fixed_window_tests;



/// Tests for Leaky Bucket algorithm
mod leaky_bucket_tests;
