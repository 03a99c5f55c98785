//! Integration test suite for kiln.
//!
//! These tests drive the scheduler end to end against real temporary
//! project directories, running small shell commands as task actions and
//! reloading the fingerprint store between runs the way separate
//! invocations would.
//!
//! # Test Categories
//!
//! - `incremental`: Up-to-date detection and minimal rebuilds
//! - `failure`: Failure isolation and skip propagation
//! - `cancellation`: Cancellation, grace period and store consistency
//! - `ordering`: Dependency ordering and the concurrency bound
//!
//! # Platform
//!
//! Task actions go through `sh -c`, so the suite only runs on unix.

#![cfg(unix)]


mod cancellation;
mod failure;
mod incremental;
mod ordering;
