use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use faultline_explore::policy::{Dpor, PrefixStrategy, Selection};
use faultline_explore::rng::{policy_rng, DECISION_STREAM};
use faultline_explore::{Policy, PolicyError, PolicyKind};
use faultline_history::{HistoryError, HistoryId, HistoryStorage, MemoryStorage};
use faultline_signal::{Action, ActionKind, Event, EventKind, Trace};
use serde_json::json;
use tokio::time::{timeout, Instant};

const PATIENCE: Duration = Duration::from_secs(30);

/// Signals that a search started, then waits to be let through.
type Gate = (mpsc::Sender<()>, mpsc::Receiver<()>);

/// Memory storage that counts prefix searches.
#[derive(Default)]
struct CountingStorage {
    inner: MemoryStorage,
    searches: AtomicUsize,
    gate: Mutex<Option<Gate>>,
}

impl CountingStorage {
    /// Storage whose first search blocks until the returned sender fires.
    /// The receiver hears when that search has started.
    fn gated() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (open_tx, open_rx) = mpsc::channel();
        let storage = Self {
            gate: Mutex::new(Some((entered_tx, open_rx))),
            ..Self::default()
        };
        (storage, entered_rx, open_tx)
    }

    fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, open)) = gate {
            entered.send(()).unwrap();
            open.recv().unwrap();
        }
    }
}

impl HistoryStorage for CountingStorage {
    fn name(&self) -> &str {
        "counting"
    }
    fn create_storage(&self) -> Result<(), HistoryError> {
        self.inner.create_storage()
    }
    fn init(&self) -> Result<(), HistoryError> {
        self.inner.init()
    }
    fn close(&self) -> Result<(), HistoryError> {
        self.inner.close()
    }
    fn create_new_working_dir(&self) -> Result<PathBuf, HistoryError> {
        self.inner.create_new_working_dir()
    }
    fn record_new_trace(&self, trace: &Trace) -> Result<(), HistoryError> {
        self.inner.record_new_trace(trace)
    }
    fn record_result(&self, successful: bool, required_time: Duration) -> Result<(), HistoryError> {
        self.inner.record_result(successful, required_time)
    }
    fn nr_stored_histories(&self) -> usize {
        self.inner.nr_stored_histories()
    }
    fn get_stored_history(&self, id: HistoryId) -> Result<Trace, HistoryError> {
        self.inner.get_stored_history(id)
    }
    fn is_successful(&self, id: HistoryId) -> Result<bool, HistoryError> {
        self.inner.is_successful(id)
    }
    fn get_required_time(&self, id: HistoryId) -> Result<Duration, HistoryError> {
        self.inner.get_required_time(id)
    }
    fn search(&self, prefix: &[Event]) -> Result<Vec<HistoryId>, HistoryError> {
        self.count();
        self.inner.search(prefix)
    }
    fn search_with_converter(
        &self,
        prefix: &[Event],
        converter: &dyn Fn(&[Event]) -> Vec<Event>,
    ) -> Result<Vec<HistoryId>, HistoryError> {
        self.count();
        self.inner.search_with_converter(prefix, converter)
    }
}

/// Storage whose only history cannot be read.
struct BrokenStorage;

impl HistoryStorage for BrokenStorage {
    fn name(&self) -> &str {
        "broken"
    }
    fn create_storage(&self) -> Result<(), HistoryError> {
        Ok(())
    }
    fn init(&self) -> Result<(), HistoryError> {
        Ok(())
    }
    fn close(&self) -> Result<(), HistoryError> {
        Ok(())
    }
    fn create_new_working_dir(&self) -> Result<PathBuf, HistoryError> {
        Err(HistoryError::NotInitialized)
    }
    fn record_new_trace(&self, _trace: &Trace) -> Result<(), HistoryError> {
        Err(HistoryError::NotInitialized)
    }
    fn record_result(&self, _successful: bool, _required_time: Duration) -> Result<(), HistoryError> {
        Err(HistoryError::NotInitialized)
    }
    fn nr_stored_histories(&self) -> usize {
        1
    }
    fn get_stored_history(&self, id: HistoryId) -> Result<Trace, HistoryError> {
        Err(HistoryError::NotFound(id))
    }
    fn is_successful(&self, id: HistoryId) -> Result<bool, HistoryError> {
        Err(HistoryError::NotFound(id))
    }
    fn get_required_time(&self, id: HistoryId) -> Result<Duration, HistoryError> {
        Err(HistoryError::NotFound(id))
    }
}

fn msg(entity: &str) -> Event {
    Event::new(entity, EventKind::Message)
}

fn call(entity: &str, name: &str) -> Event {
    Event::new(entity, EventKind::FuncCall).with_param("name", name)
}

fn etcd_message(src: &str, dst: &str, payload: &[u8]) -> Event {
    etcd_message_from("etcd0", src, dst, payload)
}

fn etcd_message_from(entity: &str, src: &str, dst: &str, payload: &[u8]) -> Event {
    Event::new(entity, EventKind::Message).with_param(
        "option",
        json!({
            "src_entity": src,
            "dst_entity": dst,
            "message": STANDARD.encode(payload),
        }),
    )
}

fn started(name: &str, params: serde_json::Value) -> Policy {
    let mut policy = Policy::create(name, &params, 7).unwrap();
    policy.init(Arc::new(MemoryStorage::new())).unwrap();
    policy
}

async fn next(policy: &mut Policy) -> Action {
    timeout(PATIENCE, policy.next_action())
        .await
        .expect("policy made no decision")
        .expect("policy failed")
}

async fn assert_quiet(policy: &mut Policy) {
    assert!(
        timeout(Duration::from_secs(2), policy.next_action())
            .await
            .is_err(),
        "unexpected extra decision"
    );
}

#[tokio::test(start_paused = true)]
async fn test_each_policy_resolves_one_event_exactly_once() {
    let cases = [
        ("dumb", msg("e1")),
        ("random", msg("e1")),
        ("BFS", msg("e1")),
        ("DFS", msg("e1")),
        ("DPOR", msg("e1")),
        ("ZK2172", call("e1", "propose")),
        (
            "etcd",
            etcd_message("10.0.0.1:2380", "10.0.0.2:7001", b"POST /raft HTTP/1.1\r\n\r\n"),
        ),
    ];
    for (name, event) in cases {
        let entity = event.entity_id.clone();
        let mut policy = started(name, json!({"interval": 10}));
        policy.queue_event(event).unwrap();

        let action = next(&mut policy).await;
        assert_eq!(action.entity_id, entity, "{name}");
        assert_eq!(action.kind, ActionKind::Accept, "{name}");
        assert_quiet(&mut policy).await;
        policy.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_bfs_empty_history_releases_queue_after_one_search() {
    let storage = Arc::new(CountingStorage::default());
    let mut policy = Policy::create("BFS", &json!({"interval": 10}), 7).unwrap();
    policy.init(storage.clone()).unwrap();

    for entity in ["e1", "e2", "e3"] {
        policy.queue_event(msg(entity)).unwrap();
    }
    let mut released = Vec::new();
    for _ in 0..3 {
        released.push(next(&mut policy).await.entity_id);
    }
    assert_eq!(released, vec!["e1", "e2", "e3"]);
    assert_eq!(storage.searches(), 1);

    // Now in dumb mode: new events skip history entirely.
    policy.queue_event(msg("e4")).unwrap();
    assert_eq!(next(&mut policy).await.entity_id, "e4");
    assert_eq!(storage.searches(), 1);
    match policy.kind() {
        PolicyKind::Bfs(bfs) => assert!(bfs.is_dumb()),
        _ => panic!("expected BFS"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_accepts_events_during_slow_search() {
    let (storage, entered, open) = CountingStorage::gated();
    let storage = Arc::new(storage);
    let mut policy = Policy::create("BFS", &json!({"interval": 10}), 7).unwrap();
    policy.init(storage.clone()).unwrap();

    policy.queue_event(msg("e1")).unwrap();
    tokio::task::spawn_blocking(move || entered.recv_timeout(PATIENCE))
        .await
        .unwrap()
        .expect("search never started");

    // The search for [e1] is still blocked here.
    policy.queue_event(msg("e2")).unwrap();
    open.send(()).unwrap();

    assert_eq!(next(&mut policy).await.entity_id, "e1");
    assert_eq!(next(&mut policy).await.entity_id, "e2");
    assert_eq!(storage.searches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dpor_keeps_searching_after_unseen_candidate() {
    let storage = Arc::new(CountingStorage::default());
    let mut policy = Policy::create("DPOR", &json!({"interval": 10}), 7).unwrap();
    policy.init(storage.clone()).unwrap();

    for entity in ["e1", "e2", "e3"] {
        policy.queue_event(msg(entity)).unwrap();
    }
    // One unseen candidate per tick, each found by a single search.
    let mut released = Vec::new();
    for _ in 0..3 {
        released.push(next(&mut policy).await.entity_id);
    }
    assert_eq!(released, vec!["e1", "e2", "e3"]);
    assert_eq!(storage.searches(), 3);

    policy.queue_event(msg("e4")).unwrap();
    assert_eq!(next(&mut policy).await.entity_id, "e4");
    assert_eq!(storage.searches(), 4);
    match policy.kind() {
        PolicyKind::Dpor(dpor) => {
            assert!(!dpor.is_dumb());
            assert_eq!(dpor.prefix_len(), 4);
        }
        _ => panic!("expected DPOR"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_dfs_replays_stored_order() {
    let storage = Arc::new(MemoryStorage::with_traces([Trace::new(vec![
        msg("b").accept_action().unwrap(),
        msg("a").accept_action().unwrap(),
    ])]));
    let mut policy = Policy::create("DFS", &json!({"interval": 10}), 7).unwrap();
    policy.init(storage).unwrap();

    policy.queue_event(msg("a")).unwrap();
    policy.queue_event(msg("b")).unwrap();
    assert_eq!(next(&mut policy).await.entity_id, "b");
    assert_eq!(next(&mut policy).await.entity_id, "a");
    match policy.kind() {
        PolicyKind::Dfs(dfs) => {
            assert!(!dfs.is_dumb());
            assert_eq!(dfs.prefix_len(), 2);
        }
        _ => panic!("expected DFS"),
    }
}

#[test]
fn test_dpor_treats_reordered_entities_as_seen() {
    let storage = MemoryStorage::with_traces([Trace::new(vec![
        msg("a").accept_action().unwrap(),
        msg("b").accept_action().unwrap(),
    ])]);
    let mut rng = policy_rng(0, DECISION_STREAM);

    // [b, a] is the stored [a, b] up to independent reordering, so `c` is
    // the only unexplored continuation.
    let selection = Dpor
        .select(&storage, &[msg("b")], &[msg("a"), msg("c")], &mut rng)
        .unwrap();
    assert_eq!(selection, Selection::Release(1));
}

#[tokio::test(start_paused = true)]
async fn test_random_kill_rate_extremes() {
    let mut policy = started(
        "random",
        json!({"interval": 5, "killRatePerEntity": {"e1": 100, "e2": 0}}),
    );
    for _ in 0..10 {
        policy.queue_event(msg("e1")).unwrap();
        policy.queue_event(msg("e2")).unwrap();
    }
    for _ in 0..20 {
        let action = next(&mut policy).await;
        match action.entity_id.as_str() {
            "e1" => assert_eq!(action.kind, ActionKind::Accept),
            "e2" => {
                assert_eq!(action.kind, ActionKind::FaultInjection);
                assert_eq!(action.fault(), Some("kill"));
            }
            other => panic!("unexpected entity {other}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_random_time_bound_applies_fault_rates() {
    let mut policy = started(
        "random",
        json!({
            "timeBound": true,
            "maxBound": 20,
            "killRatePerEntity": {"e1": 100},
            "shutdownRatePerEntity": {"e2": 0},
        }),
    );
    for _ in 0..5 {
        policy.queue_event(msg("e1")).unwrap();
        policy.queue_event(msg("e2")).unwrap();
    }
    for _ in 0..10 {
        let action = next(&mut policy).await;
        match action.entity_id.as_str() {
            "e1" => assert_eq!(action.kind, ActionKind::Accept),
            "e2" => {
                assert_eq!(action.kind, ActionKind::FaultInjection);
                assert_eq!(action.fault(), Some("shutdown"));
            }
            other => panic!("unexpected entity {other}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_random_serves_prioritized_entity_first() {
    let mut policy = started("random", json!({"interval": 10, "prioritize": "leader"}));
    policy.queue_event(msg("follower")).unwrap();
    policy.queue_event(msg("leader")).unwrap();

    assert_eq!(next(&mut policy).await.entity_id, "leader");
    assert_eq!(next(&mut policy).await.entity_id, "follower");
}

#[tokio::test(start_paused = true)]
async fn test_random_time_bound_respects_max_bound() {
    let mut policy = started("random", json!({"timeBound": true, "maxBound": 40}));
    let start = Instant::now();
    policy.queue_event(msg("e1")).unwrap();

    let action = next(&mut policy).await;
    assert_eq!(action.entity_id, "e1");
    assert!(start.elapsed() <= Duration::from_millis(41));
}

#[tokio::test(start_paused = true)]
async fn test_etcd_response_passes_and_request_is_delayed() {
    let mut policy = started("etcd", json!({"minBound": 20, "maxBound": 40}));

    let start = Instant::now();
    policy
        .queue_event(etcd_message("10.0.0.2:7001", "10.0.0.1:2380", b"HTTP/1.1 204 No Content\r\n\r\n"))
        .unwrap();
    next(&mut policy).await;
    assert!(start.elapsed() < Duration::from_millis(20));

    let start = Instant::now();
    policy
        .queue_event(etcd_message(
            "10.0.0.1:2380",
            "10.0.0.2:7001",
            b"POST /raft HTTP/1.1\r\nPath: /raft\r\n\r\nentries",
        ))
        .unwrap();
    next(&mut policy).await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(20) && waited <= Duration::from_millis(41));
}

#[tokio::test(start_paused = true)]
async fn test_etcd_request_kill_rate_extremes() {
    let mut policy = started(
        "etcd",
        json!({
            "minBound": 0,
            "maxBound": 10,
            "killRatePerEntity": {"etcd1": 100, "etcd2": 0},
        }),
    );
    let request = b"POST /raft HTTP/1.1\r\n\r\nentries";
    for entity in ["etcd1", "etcd2"] {
        for _ in 0..3 {
            policy
                .queue_event(etcd_message_from(entity, "10.0.0.1:2380", "10.0.0.2:7001", request))
                .unwrap();
        }
    }
    for _ in 0..6 {
        let action = next(&mut policy).await;
        match action.entity_id.as_str() {
            "etcd1" => assert_eq!(action.kind, ActionKind::Accept),
            "etcd2" => {
                assert_eq!(action.kind, ActionKind::FaultInjection);
                assert_eq!(action.fault(), Some("kill"));
            }
            other => panic!("unexpected entity {other}"),
        }
    }

    // Responses skip the delay queue and its fault draws.
    policy
        .queue_event(etcd_message_from(
            "etcd2",
            "10.0.0.2:7001",
            "10.0.0.1:2380",
            b"HTTP/1.1 204 No Content\r\n\r\n",
        ))
        .unwrap();
    let action = next(&mut policy).await;
    assert_eq!(action.entity_id, "etcd2");
    assert_eq!(action.kind, ActionKind::Accept);
}

#[tokio::test(start_paused = true)]
async fn test_etcd_malformed_payloads_rejected() {
    let policy = started("etcd", json!({}));

    assert!(matches!(
        policy.queue_event(msg("etcd0")),
        Err(PolicyError::MalformedEvent { .. })
    ));

    let bad_port = Event::new("etcd0", EventKind::Message).with_param(
        "option",
        json!({"src_entity": "10.0.0.1", "dst_entity": "10.0.0.2:7001", "message": ""}),
    );
    assert!(matches!(
        policy.queue_event(bad_port),
        Err(PolicyError::MalformedEvent { .. })
    ));

    let bad_base64 = Event::new("etcd0", EventKind::Message).with_param(
        "option",
        json!({"src_entity": "10.0.0.1:2380", "dst_entity": "10.0.0.2:7001", "message": "%%%"}),
    );
    assert!(matches!(
        policy.queue_event(bad_base64),
        Err(PolicyError::MalformedEvent { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_zk2172_holds_back_snapshot_deserialization() {
    let mut policy = started("ZK2172", json!({"interval": 10, "delayTicks": 5}));
    policy
        .queue_event(call("zksrv3", "deserializeSnapshot"))
        .unwrap();
    policy.queue_event(call("zksrv1", "propose")).unwrap();

    assert_eq!(next(&mut policy).await.entity_id, "zksrv1");
    assert_eq!(next(&mut policy).await.entity_id, "zksrv3");
}

#[tokio::test(start_paused = true)]
async fn test_history_failure_is_reported() {
    let mut policy = Policy::create("BFS", &json!({"interval": 10}), 7).unwrap();
    policy.init(Arc::new(BrokenStorage)).unwrap();
    policy.queue_event(msg("e1")).unwrap();

    let result = timeout(PATIENCE, policy.next_action()).await.unwrap();
    assert!(matches!(
        result,
        Err(PolicyError::History(HistoryError::NotFound(0)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_second_init_rejected() {
    let mut policy = started("dumb", json!({}));
    assert!(matches!(
        policy.init(Arc::new(MemoryStorage::new())),
        Err(PolicyError::AlreadyInitialized("dumb"))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_decisions() {
    let mut policy = started("random", json!({"interval": 10}));
    policy.shutdown();
    policy.queue_event(msg("e1")).unwrap();
    assert_quiet(&mut policy).await;
}

#[tokio::test(start_paused = true)]
async fn test_passive_events_are_not_queued() {
    let policy = started("dumb", json!({}));
    let log = Event::new("e1", EventKind::Log).with_deferred(false);
    assert!(matches!(
        policy.queue_event(log),
        Err(PolicyError::Signal(_))
    ));
}
