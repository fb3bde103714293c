//! # instancer-common
//!
//! Shared types, error definitions, settings models, and constants
//! used across the entire instancer workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives that the lifecycle manager
//! and the command layer build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
