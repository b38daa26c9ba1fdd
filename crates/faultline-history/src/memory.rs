use std::path::PathBuf;
use std::time::Duration;

use faultline_signal::Trace;
use parking_lot::Mutex;

use crate::{HistoryError, HistoryId, HistoryStorage, RunResult};

#[derive(Debug, Clone)]
struct StoredRun {
    trace: Option<Trace>,
    result: Option<RunResult>,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<StoredRun>,
    /// Working area handed out for the run in progress.
    current: Option<PathBuf>,
}

/// In-process history storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with successful runs.
    pub fn with_traces(traces: impl IntoIterator<Item = Trace>) -> Self {
        let runs = traces
            .into_iter()
            .map(|trace| StoredRun {
                trace: Some(trace),
                result: Some(RunResult {
                    successful: true,
                    required_time: Duration::ZERO,
                }),
            })
            .collect();
        Self {
            state: Mutex::new(MemoryState { runs, current: None }),
        }
    }

    fn result(&self, id: HistoryId) -> Result<RunResult, HistoryError> {
        let state = self.state.lock();
        let run = state.runs.get(id).ok_or(HistoryError::NotFound(id))?;
        run.result.clone().ok_or(HistoryError::NoResult(id))
    }
}

impl HistoryStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn create_storage(&self) -> Result<(), HistoryError> {
        *self.state.lock() = MemoryState::default();
        Ok(())
    }

    fn init(&self) -> Result<(), HistoryError> {
        Ok(())
    }

    fn close(&self) -> Result<(), HistoryError> {
        self.state.lock().current = None;
        Ok(())
    }

    fn create_new_working_dir(&self) -> Result<PathBuf, HistoryError> {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            return Err(HistoryError::WorkingDirExists(current.clone()));
        }
        let dir = PathBuf::from(format!("memory/{:08x}", state.runs.len()));
        state.runs.push(StoredRun {
            trace: None,
            result: None,
        });
        state.current = Some(dir.clone());
        Ok(dir)
    }

    fn record_new_trace(&self, trace: &Trace) -> Result<(), HistoryError> {
        let mut state = self.state.lock();
        if state.current.is_none() {
            return Err(HistoryError::NoCurrentRun);
        }
        let run = state.runs.last_mut().ok_or(HistoryError::NoCurrentRun)?;
        run.trace = Some(trace.clone());
        Ok(())
    }

    fn record_result(&self, successful: bool, required_time: Duration) -> Result<(), HistoryError> {
        let mut state = self.state.lock();
        if state.current.take().is_none() {
            return Err(HistoryError::NoCurrentRun);
        }
        let run = state.runs.last_mut().ok_or(HistoryError::NoCurrentRun)?;
        run.result = Some(RunResult {
            successful,
            required_time,
        });
        Ok(())
    }

    fn nr_stored_histories(&self) -> usize {
        self.state.lock().runs.len()
    }

    fn stored_ids(&self) -> Vec<HistoryId> {
        let state = self.state.lock();
        state
            .runs
            .iter()
            .enumerate()
            .filter(|(_, run)| run.trace.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    fn get_stored_history(&self, id: HistoryId) -> Result<Trace, HistoryError> {
        let state = self.state.lock();
        state
            .runs
            .get(id)
            .and_then(|run| run.trace.clone())
            .ok_or(HistoryError::NotFound(id))
    }

    fn is_successful(&self, id: HistoryId) -> Result<bool, HistoryError> {
        Ok(self.result(id)?.successful)
    }

    fn get_required_time(&self, id: HistoryId) -> Result<Duration, HistoryError> {
        Ok(self.result(id)?.required_time)
    }
}
