//! Suite lifecycle: one global setup shared by every worker, per-worker
//! isolation, and a single global teardown.

pub mod handoff;
mod lifecycle;

pub use handoff::Handoff;
pub use lifecycle::{install_buildpack, remove_buildpack, AppGuard, SuiteController, WorkerContext};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buildpack::PackagedBuildpack;

/// Where a worker is in the suite lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuitePhase {
    NotStarted,
    SharedStateReady,
    WorkerReady,
    TearingDown,
    Done,
}

/// Published once by global setup, read by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    pub run_id: String,
    pub buildpack: PackagedBuildpack,
    /// Name the buildpack is registered under on the platform.
    pub platform_buildpack: String,
    /// Whether this suite registered the platform buildpack and must delete it.
    pub installed: bool,
    pub created_at: DateTime<Utc>,
}
