//! Container lifecycle management for per-team challenge instances.
//!
//! The [`service::Instancer`] facade exposes the operations route handlers
//! call. Underneath it, the [`manager::LifecycleManager`] reconciles the
//! instance registry with the container runtime, and the
//! [`reaper::Reaper`] reclaims instances past their expiry.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod catalog;
pub mod clock;
pub mod connection;
pub mod docker;
pub mod endpoint;
pub mod limits;
pub mod locks;
pub mod manager;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod service;
pub mod settings;
pub mod ssh;
pub mod state_file;
pub mod volumes;
