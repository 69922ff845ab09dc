//! Stagehand Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]
//!
//! Master orchestrator for warehouse ingestion.
//!
//! # Overview
//!
//! Customer event data lands in object storage as staging files; their
//! metadata rows arrive through the HTTP ingress. This service discovers
//! which (source, destination) pairs have unprocessed staging files, groups
//! them into uploads, and drives each upload through a per-destination
//! worker under a global concurrency cap:
//!
//! - **Ingress**: staging-file registration and health reporting
//! - **Routers**: one scheduling loop per warehouse kind, reconfigured live
//!   from the backend-config feed
//! - **Workers**: per-destination upload queues, serialised per namespace
//! - **Crash recovery**: uploads interrupted mid-export are re-entered
//!   before new work starts for their pair
//!
//! # Framework Stack
//!
//! - **Axum**: HTTP ingress
//! - **SQLx**: metadata tables on PostgreSQL, plus LISTEN/NOTIFY fan-out to
//!   the staging-file parsing slaves
//! - **Tokio**: router, worker, and subscription tasks

pub mod backendconfig;
pub mod config;
pub mod error;
pub mod ingress;
pub mod notifier;
pub mod warehouse;

// Re-export commonly used types
pub use error::{AppError, AppResult};
