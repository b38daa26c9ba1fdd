//! Durable store of past execution traces.
//!
//! Explore policies only read from storage (prefix search); the campaign
//! driver records one trace and one result per run. Recorded traces are
//! append-only.
//!
//! Two backends ship with the crate:
//! - [`memory::MemoryStorage`] keeps everything in process.
//! - [`naive::NaiveStorage`] keeps one JSON file per run under a directory.

pub mod memory;
pub mod naive;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use faultline_signal::{events_match, Event, Trace};

pub use memory::MemoryStorage;
pub use naive::NaiveStorage;

/// Index of a recorded run.
pub type HistoryId = usize;

/// Name of the per-directory storage descriptor.
pub const STORAGE_CONFIG_FILE: &str = "storage.json";

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("history {0} not found")]
    NotFound(HistoryId),

    #[error("no result recorded for history {0}")]
    NoResult(HistoryId),

    #[error("working directory {0} already created for the current run")]
    WorkingDirExists(PathBuf),

    #[error("no run in progress")]
    NoCurrentRun,

    #[error("storage not initialized")]
    NotInitialized,

    #[error("unknown history storage: {0}")]
    UnknownStorage(String),
}

/// Outcome of one recorded run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub successful: bool,
    pub required_time: Duration,
}

/// Contract between the exploration core and a history backend.
///
/// Implementations use interior mutability: a single handle is shared as
/// `Arc<dyn HistoryStorage>` between the policy's background loop and the
/// campaign driver.
pub trait HistoryStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Create the backing store from scratch.
    fn create_storage(&self) -> Result<(), HistoryError>;

    /// Open an existing store.
    fn init(&self) -> Result<(), HistoryError>;

    fn close(&self) -> Result<(), HistoryError>;

    /// Allocate the working area of the next run.
    fn create_new_working_dir(&self) -> Result<PathBuf, HistoryError>;

    fn record_new_trace(&self, trace: &Trace) -> Result<(), HistoryError>;

    fn record_result(&self, successful: bool, required_time: Duration) -> Result<(), HistoryError>;

    /// Number of runs the store knows about, recorded or not.
    fn nr_stored_histories(&self) -> usize;

    fn get_stored_history(&self, id: HistoryId) -> Result<Trace, HistoryError>;

    fn is_successful(&self, id: HistoryId) -> Result<bool, HistoryError>;

    fn get_required_time(&self, id: HistoryId) -> Result<Duration, HistoryError>;

    /// Ids whose trace has been recorded and can be searched.
    fn stored_ids(&self) -> Vec<HistoryId> {
        (0..self.nr_stored_histories()).collect()
    }

    /// Ids of every recorded trace whose decided events start with `prefix`.
    ///
    /// An empty result means "nothing matches"; errors are reserved for a
    /// store that cannot be read.
    fn search(&self, prefix: &[Event]) -> Result<Vec<HistoryId>, HistoryError> {
        self.search_with_converter(prefix, &|events: &[Event]| events.to_vec())
    }

    /// Like [`HistoryStorage::search`], comparing `converter(prefix)` with
    /// `converter(stored[..prefix.len()])` for each stored trace.
    fn search_with_converter(
        &self,
        prefix: &[Event],
        converter: &dyn Fn(&[Event]) -> Vec<Event>,
    ) -> Result<Vec<HistoryId>, HistoryError> {
        let query = converter(prefix);
        let mut matched = Vec::new();
        for id in self.stored_ids() {
            let history = self.get_stored_history(id)?;
            let events = history.decided_events();
            if events.len() < prefix.len() {
                continue;
            }
            let converted = converter(&events[..prefix.len()]);
            if events_match(&query, &converted) {
                matched.push(id);
            }
        }
        Ok(matched)
    }
}

/// Construct a backend by name.
pub fn create_storage(
    name: &str,
    dir: impl AsRef<Path>,
) -> Result<Arc<dyn HistoryStorage>, HistoryError> {
    match name {
        "naive" => Ok(Arc::new(NaiveStorage::new(dir.as_ref()))),
        "memory" => Ok(Arc::new(MemoryStorage::new())),
        other => Err(HistoryError::UnknownStorage(other.to_string())),
    }
}

/// Open the backend described by `dir/storage.json` and initialize it.
///
/// Directories without a `storageType` entry are treated as naive stores.
pub fn load_storage(dir: impl AsRef<Path>) -> Result<Arc<dyn HistoryStorage>, HistoryError> {
    let dir = dir.as_ref();
    let raw = std::fs::read(dir.join(STORAGE_CONFIG_FILE))?;
    let root: serde_json::Value = serde_json::from_slice(&raw)?;
    let storage_type = root
        .get("storageType")
        .and_then(|v| v.as_str())
        .unwrap_or("naive");
    let storage = create_storage(storage_type, dir)?;
    storage.init()?;
    Ok(storage)
}
