//! Lifecycle management for function backends.
//!
//! Tracks which backend serves each function, removes backends left over by
//! earlier executor instances, reclaims idle backends and keeps fetcher
//! access and mesh routing in step with function definitions.

pub mod app;
pub mod app_builder;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fscache;
pub mod k8s;
pub mod naming;
pub mod rbac;
pub mod reaper;
pub mod reconciler;
pub mod signals;
pub mod soft_failure;
