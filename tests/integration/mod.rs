//! Integration test suite for roaster.
//!
//! These tests drive real git repositories in temporary directories and
//! real `sh` processes standing in for the coding agent. The bean store is
//! the in-memory one, so no `beans` binary is needed.
//!
//! # Test Categories
//!
//! - `branching`: branch lineage, merge strategies and conflict rollback
//! - `completion`: outcome classification and its side effects
//! - `watcher`: filesystem change detection and debouncing
//! - `orchestrator`: the daemon loop, control commands and crash recovery

mod fixtures;

mod completion;
mod orchestrator;
mod watcher;
