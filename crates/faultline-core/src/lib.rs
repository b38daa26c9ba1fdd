//! Orchestration of one testing campaign.
//!
//! Entities connect to an [`orchestrator::Orchestrator`], report events and
//! block on deferred ones until the explore policy decides. A
//! [`campaign::Campaign`] drives successive runs against one history
//! storage, recording each run's trace and outcome.

pub mod campaign;
pub mod config;
pub mod entity;
pub mod logging;
pub mod orchestrator;

pub use campaign::{ActiveRun, Campaign, CampaignError, RunReport};
pub use config::{ConfigError, ExploreConfig};
pub use entity::{EntityError, TransitionEntity, UNINITIALIZED_ENTITY};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle};
