//! Scenario tests for the ekstest pipeline
//!
//! Every scenario drives a real [`ekstest::Tester`] against the in-memory
//! provider and `kubectl` doubles, so no account or cluster is needed:
//!
//! ```bash
//! cargo test --test scenarios
//! ```

mod scenario_tests;
