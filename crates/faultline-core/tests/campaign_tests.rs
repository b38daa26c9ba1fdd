use std::sync::Arc;
use std::time::Duration;

use faultline_core::{Campaign, CampaignError, ConfigError, EntityError, ExploreConfig};
use faultline_history::{load_storage, HistoryStorage, MemoryStorage};
use faultline_signal::{ActionKind, Event, EventKind};
use serde_json::json;
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(5);

fn config(policy: &str) -> ExploreConfig {
    ExploreConfig {
        explore_policy: policy.to_string(),
        explore_policy_param: json!({ "interval": 10 }),
        storage_type: "memory".to_string(),
        seed: 100,
        ..ExploreConfig::default()
    }
}

fn memory_campaign(policy: &str) -> Campaign {
    faultline_core::logging::try_init();
    Campaign::new(config(policy), Arc::new(MemoryStorage::new())).unwrap()
}

#[tokio::test]
async fn test_run_is_recorded() {
    let campaign = memory_campaign("dumb");
    let run = campaign.begin_run().unwrap();
    assert_eq!(run.run_id(), 0);
    assert_eq!(run.seed(), 100);

    let mut entity = run.connect_entity();
    let action = timeout(PATIENCE, entity.send_event(Event::new("e1", EventKind::Message)))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(action.kind, ActionKind::Accept);
    drop(entity);

    let report = run.finish(true).await.unwrap();
    assert_eq!(report.run_id, 0);
    assert!(report.successful);
    assert_eq!(report.trace.len(), 1);
    assert_eq!(campaign.runs_completed(), 1);

    let storage = campaign.storage();
    assert_eq!(storage.nr_stored_histories(), 1);
    assert!(storage.is_successful(0).unwrap());
    assert_eq!(storage.get_stored_history(0).unwrap(), report.trace);
}

#[tokio::test]
async fn test_entity_accepted_after_finish() {
    let campaign = memory_campaign("dumb");
    let run = campaign.begin_run().unwrap();
    let mut entity = run.connect_entity();
    timeout(PATIENCE, entity.send_event(Event::new("e1", EventKind::Message)))
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let report = run.finish(true).await.unwrap();
    assert_eq!(report.trace.len(), 1);

    // The process is shutting down and still reports events.
    let action = timeout(PATIENCE, entity.send_event(Event::new("e1", EventKind::FuncCall)))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(action.kind, ActionKind::Accept);
    let recorded = campaign.storage().get_stored_history(0).unwrap();
    assert_eq!(recorded.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_cuts_off_lingering_entity() {
    faultline_core::logging::try_init();
    let config = ExploreConfig {
        drain_timeout_ms: 50,
        ..config("dumb")
    };
    let campaign = Campaign::new(config, Arc::new(MemoryStorage::new())).unwrap();
    let run = campaign.begin_run().unwrap();
    let mut entity = run.connect_entity();
    entity
        .send_event(Event::new("e1", EventKind::Log).with_deferred(false))
        .await
        .unwrap();
    run.finish(true).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let result = entity.send_event(Event::new("e1", EventKind::Message)).await;
    assert_eq!(result, Err(EntityError::Disconnected));
}

#[tokio::test]
async fn test_successive_runs_advance_seed() {
    let campaign = memory_campaign("random");
    for expected in 0..3usize {
        let run = campaign.begin_run().unwrap();
        assert_eq!(run.run_id(), expected);
        assert_eq!(run.seed(), 100 + expected as u64);
        let report = run.finish(expected % 2 == 0).await.unwrap();
        assert!(report.trace.is_empty());
    }
    assert_eq!(campaign.runs_completed(), 3);
    assert!(campaign.storage().is_successful(0).unwrap());
    assert!(!campaign.storage().is_successful(1).unwrap());
}

#[tokio::test]
async fn test_recorded_run_is_searchable() {
    let campaign = memory_campaign("DFS");

    let run = campaign.begin_run().unwrap();
    let mut entity = run.connect_entity();
    timeout(PATIENCE, entity.send_event(Event::new("e1", EventKind::Message)))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    drop(entity);
    run.finish(true).await.unwrap();

    let hits = campaign
        .storage()
        .search(&[Event::new("e1", EventKind::Message)])
        .unwrap();
    assert_eq!(hits, vec![0]);
}

#[tokio::test]
async fn test_failed_orchestrator_recorded_without_trace() {
    let campaign = memory_campaign("dumb");
    let run = campaign.begin_run().unwrap();
    let mut first = run.connect_entity();
    let mut second = run.connect_entity();
    first
        .send_event(Event::new("e1", EventKind::Log).with_deferred(false))
        .await
        .unwrap();
    second
        .send_event(Event::new("e1", EventKind::Log).with_deferred(false))
        .await
        .unwrap();

    let err = run.finish(true).await.unwrap_err();
    assert!(matches!(err, CampaignError::Orchestrator(_)));
    assert_eq!(campaign.runs_completed(), 1);
    assert!(!campaign.storage().is_successful(0).unwrap());
    assert!(campaign.storage().stored_ids().is_empty());

    // The store accepts the next run.
    let next = campaign.begin_run().unwrap();
    assert_eq!(next.run_id(), 1);
    next.finish(true).await.unwrap();
}

#[tokio::test]
async fn test_naive_campaign_persists_runs() {
    faultline_core::logging::try_init();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("history");
    let mut config = config("BFS");
    config.storage_type = "naive".to_string();

    let campaign = Campaign::create(config.clone(), &root).unwrap();
    let run = campaign.begin_run().unwrap();
    assert!(run.working_dir().starts_with(&root));
    let mut entity = run.connect_entity();
    timeout(PATIENCE, entity.send_event(Event::new("e1", EventKind::Message)))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    drop(entity);
    let report = run.finish(false).await.unwrap();
    assert!(report.working_dir.exists());

    let reopened = load_storage(&root).unwrap();
    assert_eq!(reopened.nr_stored_histories(), 1);
    assert!(!reopened.is_successful(0).unwrap());
    assert_eq!(reopened.get_stored_history(0).unwrap().len(), 1);

    let resumed = Campaign::open(config, &root).unwrap();
    assert_eq!(resumed.begin_run().unwrap().run_id(), 1);
}

#[test]
fn test_unknown_policy_rejected() {
    let result = Campaign::new(config("chaos"), Arc::new(MemoryStorage::new()));
    assert!(matches!(
        result,
        Err(CampaignError::Config(ConfigError::UnknownPolicy(name))) if name == "chaos"
    ));
}
