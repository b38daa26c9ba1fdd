//! Successive runs against one history storage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faultline_explore::{Policy, PolicyError};
use faultline_history::{create_storage, load_storage, HistoryError, HistoryStorage};
use faultline_signal::Trace;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ExploreConfig};
use crate::entity::TransitionEntity;
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle};

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("history storage error: {0}")]
    History(#[from] HistoryError),

    #[error("explore policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("orchestrator task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of one finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: usize,
    pub working_dir: PathBuf,
    pub trace: Trace,
    pub successful: bool,
    pub required_time: Duration,
}

/// Drives runs of one explore configuration.
pub struct Campaign {
    config: ExploreConfig,
    storage: Arc<dyn HistoryStorage>,
    completed: Arc<AtomicUsize>,
}

impl Campaign {
    /// `storage` must already be initialized.
    pub fn new(config: ExploreConfig, storage: Arc<dyn HistoryStorage>) -> Result<Self, CampaignError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            completed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create a fresh store of `config.storage_type` under `dir`.
    pub fn create(config: ExploreConfig, dir: impl AsRef<Path>) -> Result<Self, CampaignError> {
        let storage = create_storage(&config.storage_type, dir)?;
        storage.create_storage()?;
        storage.init()?;
        Self::new(config, storage)
    }

    /// Continue a campaign over the store already at `dir`.
    pub fn open(config: ExploreConfig, dir: impl AsRef<Path>) -> Result<Self, CampaignError> {
        let storage = load_storage(dir)?;
        Self::new(config, storage)
    }

    pub fn config(&self) -> &ExploreConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.storage
    }

    /// Runs finished so far, failed ones included.
    pub fn runs_completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Start the next run. Must be called inside a tokio runtime.
    pub fn begin_run(&self) -> Result<ActiveRun, CampaignError> {
        let run_id = self.storage.nr_stored_histories();
        let seed = self.config.run_seed(run_id);
        let mut policy = Policy::create(
            &self.config.explore_policy,
            &self.config.explore_policy_param,
            seed,
        )?;
        let working_dir = self.storage.create_new_working_dir()?;
        if let Err(err) = policy.init(Arc::clone(&self.storage)) {
            self.storage.record_result(false, Duration::ZERO)?;
            return Err(err.into());
        }

        let (orchestrator, handle) = Orchestrator::new(policy);
        let task = tokio::spawn(orchestrator.run());
        info!(
            run_id,
            seed,
            policy = %self.config.explore_policy,
            dir = %working_dir.display(),
            "run started"
        );
        Ok(ActiveRun {
            run_id,
            seed,
            working_dir,
            drain_timeout: self.config.drain_timeout(),
            started: Instant::now(),
            handle,
            task,
            storage: Arc::clone(&self.storage),
            completed: Arc::clone(&self.completed),
        })
    }
}

/// A run in progress. Entities connect through it; `finish` records it.
pub struct ActiveRun {
    run_id: usize,
    seed: u64,
    working_dir: PathBuf,
    drain_timeout: Duration,
    started: Instant,
    handle: OrchestratorHandle,
    task: JoinHandle<Result<(), OrchestratorError>>,
    storage: Arc<dyn HistoryStorage>,
    completed: Arc<AtomicUsize>,
}

impl ActiveRun {
    pub fn run_id(&self) -> usize {
        self.run_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    pub fn connect_entity(&self) -> TransitionEntity {
        self.handle.connect_entity()
    }

    /// End the run and record its trace and outcome.
    ///
    /// The orchestrator keeps draining in the background, auto-accepting
    /// events until every entity disconnects or the drain timeout expires.
    /// A run whose orchestrator failed is recorded as unsuccessful without
    /// a trace, and the failure is returned.
    pub async fn finish(self, successful: bool) -> Result<RunReport, CampaignError> {
        let required_time = self.started.elapsed();
        let ended = self.handle.end_run().await;
        self.completed.fetch_add(1, Ordering::Relaxed);

        let trace = match ended {
            Ok(trace) => trace,
            Err(stopped) => {
                self.handle.terminate();
                let cause = match self.task.await? {
                    Err(err) => err,
                    Ok(()) => stopped,
                };
                error!(run_id = self.run_id, error = %cause, "run failed");
                self.storage.record_result(false, required_time)?;
                return Err(cause.into());
            }
        };

        let recorded = self
            .storage
            .record_new_trace(&trace)
            .and_then(|()| self.storage.record_result(successful, required_time));
        if let Err(err) = recorded {
            self.handle.terminate();
            return Err(err.into());
        }
        info!(
            run_id = self.run_id,
            actions = trace.len(),
            successful,
            required_ms = required_time.as_millis() as u64,
            "run recorded"
        );
        tokio::spawn(drain(
            self.run_id,
            self.handle,
            self.task,
            self.drain_timeout,
        ));
        Ok(RunReport {
            run_id: self.run_id,
            working_dir: self.working_dir,
            trace,
            successful,
            required_time,
        })
    }
}

/// Wait for a draining orchestrator, cutting it off after `grace`.
async fn drain(
    run_id: usize,
    handle: OrchestratorHandle,
    mut task: JoinHandle<Result<(), OrchestratorError>>,
    grace: Duration,
) {
    let joined = match timeout(grace, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(run_id, grace_ms = grace.as_millis() as u64, "entities still connected, terminating");
            handle.terminate();
            task.await
        }
    };
    match joined {
        Ok(Ok(())) => debug!(run_id, "run drained"),
        Ok(Err(err)) => warn!(run_id, error = %err, "orchestrator failed while draining"),
        Err(err) => error!(run_id, error = %err, "orchestrator task panicked"),
    }
}
