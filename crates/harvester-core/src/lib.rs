//! Harvester Core Components
//!
//! This crate provides the daemon-side pieces around the harvest engine:
//! configuration, run metrics, and the registry of in-flight and recent runs.

mod config;
mod error;
mod metrics;
mod registry;

pub use config::{HarvesterConfig, CONFIG_ENV};
pub use error::CoreError;
pub use metrics::{LatencyTracker, Metrics};
pub use registry::{
    completed_summary, failed_summary, validate_workspace_id, RunGuard, WorkspaceRegistry,
};
