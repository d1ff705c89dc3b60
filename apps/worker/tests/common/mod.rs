//! Common test utilities for worker integration tests
//!
//! Provides fakes for the worker's collaborators (connectivity monitors, job
//! handlers, metadata sink, filters) and helpers for building a scheduler
//! over an in-memory store.

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
