//! Stagehand
//!
//! A black-box integration harness for Cloud Foundry buildpacks. Fixture
//! applications are pushed through the `cf` CLI with the buildpack under
//! test; scenarios then assert on HTTP responses, captured output, process
//! lifecycle, and network isolation during staging.
//!
//! # Layout
//!
//! - [`process`]: every external command goes through a `CommandRunner`
//! - [`buildpack`]: packaging and the archive's dependency manifest
//! - [`app`] and [`driver`]: application handles and the push/poll/confirm loop
//! - [`proxy`] and [`traffic`]: local staging with packet capture
//! - [`suite`]: one global setup shared by every worker via a hand-off directory
//!
//! Live-platform scenarios live in `tests/e2e` behind the `platform-e2e` feature.

pub mod app;
pub mod browser;
pub mod buildpack;
pub mod cli;
pub mod config;
pub mod driver;
pub mod droplet;
pub mod error;
pub mod fixture;
pub mod http;
pub mod output;
pub mod platform;
pub mod poll;
pub mod process;
pub mod proxy;
pub mod suite;
pub mod telemetry;
pub mod traffic;

pub use app::{destroy_app, App, AppSettings, InstanceState, NameGenerator};
pub use buildpack::{BuildpackManifest, PackagedBuildpack, Packager};
pub use config::SuiteConfig;
pub use driver::{Deployable, DeploymentDriver};
pub use error::{HarnessError, Result};
pub use fixture::{Fixture, FixtureRoot, WorkingCopy};
pub use output::LogBuffer;
pub use poll::{Poller, Probe};
pub use proxy::RecordingProxy;
pub use suite::{AppGuard, SharedState, SuiteController, SuitePhase, WorkerContext};
pub use traffic::{StagingOutcome, TrafficMonitor, TrafficRecord};
