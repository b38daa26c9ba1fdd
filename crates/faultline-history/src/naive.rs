//! Directory-backed history storage.
//!
//! Layout:
//! - `{dir}/storage.json`: storage type and number of runs handed out.
//! - `{dir}/{id:08x}/history.json`: the recorded trace of run `id`.
//! - `{dir}/{id:08x}/result.json`: whether the run succeeded and how long it took.
//!
//! A run whose trace was never recorded keeps its directory but is skipped
//! by search.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use faultline_signal::Trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{HistoryError, HistoryId, HistoryStorage, RunResult, STORAGE_CONFIG_FILE};

const HISTORY_FILE: &str = "history.json";
const RESULT_FILE: &str = "result.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageInfo {
    storage_type: String,
    nr_collected_traces: usize,
}

#[derive(Debug, Default)]
struct NaiveState {
    info: Option<StorageInfo>,
    current: Option<PathBuf>,
}

pub struct NaiveStorage {
    dir: PathBuf,
    state: Mutex<NaiveState>,
}

impl NaiveStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(NaiveState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_dir(&self, id: HistoryId) -> PathBuf {
        self.dir.join(format!("{id:08x}"))
    }

    fn write_info(&self, info: &StorageInfo) -> Result<(), HistoryError> {
        let json = serde_json::to_vec_pretty(info)?;
        fs::write(self.dir.join(STORAGE_CONFIG_FILE), json)?;
        Ok(())
    }

    fn current_dir(&self) -> Result<PathBuf, HistoryError> {
        self.state
            .lock()
            .current
            .clone()
            .ok_or(HistoryError::NoCurrentRun)
    }

    fn read_result(&self, id: HistoryId) -> Result<RunResult, HistoryError> {
        let path = self.run_dir(id).join(RESULT_FILE);
        if !path.exists() {
            return Err(HistoryError::NoResult(id));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

impl HistoryStorage for NaiveStorage {
    fn name(&self) -> &str {
        "naive"
    }

    fn create_storage(&self) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.dir)?;
        let info = StorageInfo {
            storage_type: "naive".to_string(),
            nr_collected_traces: 0,
        };
        self.write_info(&info)?;
        info!(dir = %self.dir.display(), "created naive history storage");
        Ok(())
    }

    fn init(&self) -> Result<(), HistoryError> {
        let raw = fs::read(self.dir.join(STORAGE_CONFIG_FILE))?;
        let info: StorageInfo = serde_json::from_slice(&raw)?;
        debug!(
            traces = info.nr_collected_traces,
            "opened naive history storage"
        );
        self.state.lock().info = Some(info);
        Ok(())
    }

    fn close(&self) -> Result<(), HistoryError> {
        *self.state.lock() = NaiveState::default();
        Ok(())
    }

    fn create_new_working_dir(&self) -> Result<PathBuf, HistoryError> {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            return Err(HistoryError::WorkingDirExists(current.clone()));
        }
        let mut info = state.info.clone().ok_or(HistoryError::NotInitialized)?;
        let path = self.run_dir(info.nr_collected_traces);
        fs::create_dir(&path)?;
        info.nr_collected_traces += 1;
        self.write_info(&info)?;
        state.info = Some(info);
        state.current = Some(path.clone());
        Ok(path)
    }

    fn record_new_trace(&self, trace: &Trace) -> Result<(), HistoryError> {
        let dir = self.current_dir()?;
        let path = dir.join(HISTORY_FILE);
        fs::write(&path, serde_json::to_vec_pretty(trace)?)?;
        debug!(path = %path.display(), actions = trace.len(), "recorded trace");
        Ok(())
    }

    fn record_result(&self, successful: bool, required_time: Duration) -> Result<(), HistoryError> {
        let dir = self.current_dir()?;
        let result = RunResult {
            successful,
            required_time,
        };
        fs::write(dir.join(RESULT_FILE), serde_json::to_vec_pretty(&result)?)?;
        self.state.lock().current = None;
        Ok(())
    }

    fn nr_stored_histories(&self) -> usize {
        self.state
            .lock()
            .info
            .as_ref()
            .map(|info| info.nr_collected_traces)
            .unwrap_or(0)
    }

    fn stored_ids(&self) -> Vec<HistoryId> {
        (0..self.nr_stored_histories())
            .filter(|id| self.run_dir(*id).join(HISTORY_FILE).exists())
            .collect()
    }

    fn get_stored_history(&self, id: HistoryId) -> Result<Trace, HistoryError> {
        let path = self.run_dir(id).join(HISTORY_FILE);
        if !path.exists() {
            return Err(HistoryError::NotFound(id));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn is_successful(&self, id: HistoryId) -> Result<bool, HistoryError> {
        Ok(self.read_result(id)?.successful)
    }

    fn get_required_time(&self, id: HistoryId) -> Result<Duration, HistoryError> {
        Ok(self.read_result(id)?.required_time)
    }
}
