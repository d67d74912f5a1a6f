//! Integration test suite entry point
//!
//! All test modules are organized under `tests/integration/`.
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run a specific module
//! cargo test --test integration_tests socks_flow
//! ```

mod integration;
