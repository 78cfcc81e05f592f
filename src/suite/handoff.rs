//! File-based coordination between suite workers.
//!
//! Workers share nothing but a directory. Layout:
//!
//! ```text
//! <dir>/setup.lock      created by the worker elected to run global setup
//! <dir>/shared.json     the published SharedState
//! <dir>/setup.failed    the elected worker's error message
//! <dir>/workers/<id>    one marker per live worker
//! <dir>/teardown.lock   created by the worker that runs global teardown
//! ```
//!
//! Elections use `create_new`, which is atomic on every local filesystem.
//! `shared.json` is written to a temporary name and renamed into place, so a
//! reader never observes a partial document.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::poll::{Poller, Probe};

const SETUP_LOCK: &str = "setup.lock";
const SHARED_STATE: &str = "shared.json";
const SETUP_FAILED: &str = "setup.failed";
const TEARDOWN_LOCK: &str = "teardown.lock";
const WORKERS: &str = "workers";

/// What a worker found while waiting for global setup.
#[derive(Debug)]
enum Published<T> {
    State(T),
    Failed(String),
}

/// Handle on a hand-off directory.
#[derive(Debug, Clone)]
pub struct Handoff {
    dir: PathBuf,
}

/// Create `path` exclusively. `Ok(false)` if it already exists.
fn create_exclusive(path: &Path, content: &str) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Handoff {
    /// Open (creating if needed) the hand-off directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(WORKERS)).map_err(|e| {
            HarnessError::setup(format!("cannot create hand-off dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True for exactly one caller per directory.
    pub fn try_elect(&self, worker: &str) -> Result<bool> {
        let elected = create_exclusive(&self.dir.join(SETUP_LOCK), worker)?;
        if elected {
            info!(worker, dir = %self.dir.display(), "elected to run global setup");
        }
        Ok(elected)
    }

    /// Publish the shared state atomically.
    pub fn publish<T: Serialize>(&self, state: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.dir.join(format!("{}.tmp", SHARED_STATE));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.dir.join(SHARED_STATE))?;
        debug!(dir = %self.dir.display(), "published shared state");
        Ok(())
    }

    /// Record that global setup failed; every waiting worker will fail with it.
    pub fn publish_failure(&self, message: &str) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", SETUP_FAILED));
        std::fs::write(&tmp, message)?;
        std::fs::rename(&tmp, self.dir.join(SETUP_FAILED))?;
        Ok(())
    }

    fn read_published<T: DeserializeOwned>(&self) -> Result<Option<Published<T>>> {
        match std::fs::read_to_string(self.dir.join(SETUP_FAILED)) {
            Ok(message) => return Ok(Some(Published::Failed(message))),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.shared_state()?.map(Published::State))
    }

    /// The published state, if any, without waiting.
    pub fn shared_state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match std::fs::read_to_string(self.dir.join(SHARED_STATE)) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the elected worker's result.
    pub async fn wait_for<T: DeserializeOwned>(&self, poller: &Poller) -> Result<T> {
        let published = poller
            .until("global setup to publish shared state", || async move {
                if self.teardown_started() {
                    return Err(HarnessError::setup("suite has already been torn down"));
                }
                Ok(match self.read_published::<T>()? {
                    Some(published) => Probe::Ready(published),
                    None => Probe::Pending("no shared state yet".to_string()),
                })
            })
            .await
            .map_err(|e| match e {
                HarnessError::Timeout { elapsed, .. } => HarnessError::setup(format!(
                    "global setup did not finish within {:?}",
                    elapsed
                )),
                other => other,
            })?;
        match published {
            Published::State(state) => Ok(state),
            Published::Failed(message) => Err(HarnessError::setup(format!(
                "global setup failed: {}",
                message.trim()
            ))),
        }
    }

    /// Register a live worker.
    pub fn register_worker(&self, worker: &str) -> Result<()> {
        std::fs::write(self.dir.join(WORKERS).join(worker), b"")?;
        Ok(())
    }

    /// Remove a worker's marker and return how many workers remain.
    pub fn deregister_worker(&self, worker: &str) -> Result<usize> {
        match std::fs::remove_file(self.dir.join(WORKERS).join(worker)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.live_workers()
    }

    pub fn live_workers(&self) -> Result<usize> {
        Ok(std::fs::read_dir(self.dir.join(WORKERS))?.count())
    }

    /// True for exactly one caller once every worker is gone.
    pub fn try_claim_teardown(&self, worker: &str) -> Result<bool> {
        create_exclusive(&self.dir.join(TEARDOWN_LOCK), worker)
    }

    pub fn teardown_started(&self) -> bool {
        self.dir.join(TEARDOWN_LOCK).exists()
    }

    /// Delete the directory so the next run with the same id starts fresh.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "cleared hand-off dir");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
