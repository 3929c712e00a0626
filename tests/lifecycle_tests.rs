/// Lifecycle tests
///
/// Connect/disconnect flows through `DataSockets`: eligibility, session
/// uniqueness, construction and change signals, cancellation and wipes.
/// Run with: cargo test --test lifecycle_tests

use async_trait::async_trait;
use datasockets::session::{DATA_LOADED_TAG, Participant};
use datasockets::storage::{BlobSlot, FallbackPolicy};
use datasockets::{
    Color, DataError, DataNetwork, DataOptions, DataSockets, FieldMap, FieldValue, LoadIssue,
    LoadMethod, Player, Pose, Record, Roster, Rule, SessionState, Signal, StorageBackend,
    TemplateKind, TemplateNode, Vec3, resolve_structure,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn options() -> DataOptions {
    DataOptions::new("Lifecycle").autosave_interval(None)
}

fn structure() -> Vec<TemplateNode> {
    vec![
        TemplateNode::new("loginAmount", TemplateKind::IntValue(0)),
        TemplateNode::new("Tint", TemplateKind::Color3Value(Color::new(1.0, 0.5, 0.0))),
        TemplateNode::new("Spawn", TemplateKind::CFrameValue(Pose::at(Vec3::new(0.0, 5.0, 0.0)))),
    ]
}

fn setup() -> (Arc<DataSockets>, Arc<DataNetwork>) {
    let options = options();
    let network = DataNetwork::new(&options, resolve_structure(&structure(), &[]));
    let sockets = DataSockets::new(options, network.clone());
    (sockets, network)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Delays every load; everything else goes straight to the inner network.
struct SlowBackend {
    inner: Arc<DataNetwork>,
    delay: Duration,
}

#[async_trait]
impl StorageBackend for SlowBackend {
    async fn load_record(
        &self,
        key: &str,
        method: LoadMethod,
        read_only: bool,
    ) -> datasockets::Result<Option<Arc<Record>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load_record(key, method, read_only).await
    }

    fn get_cached_record(&self, key: &str) -> Option<Arc<Record>> {
        self.inner.get_cached_record(key)
    }

    fn default_shape(&self) -> FieldMap {
        self.inner.default_shape()
    }

    fn load_issues(&self) -> &Signal<LoadIssue> {
        self.inner.load_issues()
    }

    fn set_fallback_policy(&self, policy: FallbackPolicy) {
        self.inner.set_fallback_policy(policy)
    }
}

/// Never has a record; counts every call that could touch storage.
#[derive(Default)]
struct AbsentBackend {
    loads: AtomicUsize,
    finalized: AtomicUsize,
    issues: Signal<LoadIssue>,
}

#[async_trait]
impl StorageBackend for AbsentBackend {
    async fn load_record(
        &self,
        _key: &str,
        _method: LoadMethod,
        _read_only: bool,
    ) -> datasockets::Result<Option<Arc<Record>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn get_cached_record(&self, _key: &str) -> Option<Arc<Record>> {
        None
    }

    async fn finalize_record(&self, _record: &Arc<Record>) -> datasockets::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn default_shape(&self) -> FieldMap {
        FieldMap::new()
    }

    fn load_issues(&self) -> &Signal<LoadIssue> {
        &self.issues
    }

    fn set_fallback_policy(&self, _policy: FallbackPolicy) {}
}

/// A participant whose tagging takes a while, stretching activation.
struct SlowTagPlayer {
    inner: Player,
    delay: Duration,
}

impl Participant for SlowTagPlayer {
    fn user_id(&self) -> u64 {
        self.inner.user_id()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn account_age_days(&self) -> u32 {
        self.inner.account_age_days()
    }

    fn kick(&self, message: &str) {
        self.inner.kick(message)
    }

    fn add_tag(&self, tag: &str) {
        std::thread::sleep(self.delay);
        self.inner.add_tag(tag)
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.inner.has_tag(tag)
    }
}

#[tokio::test]
async fn test_too_new_account_is_kicked_without_session() {
    let backend = Arc::new(AbsentBackend::default());
    let sockets = DataSockets::new(options(), backend.clone());
    let player = Player::shared(1, "Fresh", 0);

    let session = sockets.handle_connect(player.clone()).await;

    assert!(session.is_none());
    assert!(!sockets.has_session(1).await);
    let (_, too_new) = Rule::TooNew.messages("Fresh");
    assert_eq!(player.kick_messages(), vec![too_new]);
    assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_constructed_fires_once_with_decoded_record() {
    let (sockets, _network) = setup();
    let constructed = Arc::new(Mutex::new(Vec::new()));
    let sink = constructed.clone();
    sockets.constructed().connect(move |event| {
        sink.lock()
            .unwrap()
            .push((event.participant.user_id(), event.record.clone()));
    });

    let player = Player::shared(7, "Builder", 30);
    let session = sockets.handle_connect(player.clone()).await.unwrap();
    assert_eq!(session.wait_settled().await, SessionState::Active);

    let constructed = constructed.lock().unwrap();
    assert_eq!(constructed.len(), 1);
    let (user_id, record) = &constructed[0];
    assert_eq!(*user_id, 7);
    assert!(matches!(record.get("Tint"), Some(FieldValue::Color(_))));
    assert!(matches!(record.get("Spawn"), Some(FieldValue::Pose(_))));
    assert!(player.has_tag(DATA_LOADED_TAG));
    assert!(!player.was_kicked());
}

#[tokio::test]
async fn test_disconnect_during_slow_load_cancels_it() {
    let options = options();
    let network = DataNetwork::new(&options, resolve_structure(&structure(), &[]));
    let backend = Arc::new(SlowBackend {
        inner: network.clone(),
        delay: Duration::from_millis(300),
    });
    let sockets = DataSockets::new(options, backend);
    let constructed = Arc::new(AtomicUsize::new(0));
    let counter = constructed.clone();
    sockets.constructed().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let player = Player::shared(3, "Runner", 30);
    let session = sockets.handle_connect(player.clone()).await.unwrap();
    assert_eq!(session.state(), SessionState::Loading);

    sockets.close(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(constructed.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!sockets.has_session(3).await);
    assert!(network.get_cached_record(&sockets.format_key(3)).is_none());
    assert!(!player.has_tag(DATA_LOADED_TAG));
    assert!(!player.was_kicked());
}

#[tokio::test]
async fn test_request_wipe_without_record_touches_nothing() {
    let backend = Arc::new(AbsentBackend::default());
    let sockets = DataSockets::new(options(), backend.clone());
    let player = Player::shared(4, "Ghost", 30);

    let wiped = sockets.request_wipe(player.clone()).await.unwrap();

    assert!(!wiped);
    assert_eq!(backend.finalized.load(Ordering::SeqCst), 0);
    assert!(!sockets.has_session(4).await);
}

#[tokio::test]
async fn test_pose_and_color_survive_save_and_reload() {
    let (sockets, _network) = setup();
    let pose = Pose::from_vectors(
        Vec3::new(1.5, -2.25, 10.0),
        Vec3::new(0.0, 0.0, 1.0),
        Vec3::Y,
        Vec3::new(1.0, 0.0, 0.0),
    );
    let color = Color::new(0.3, 0.71, 0.999);

    let player = Player::shared(5, "Painter", 30);
    let record = sockets.request_record(player.clone()).await.unwrap().unwrap();
    record.set("Spawn", pose).unwrap();

    // In place first: encode, then decode again.
    record.serialize().unwrap();
    assert!(record.get("Spawn").unwrap().as_map().is_some());
    record.deserialize().unwrap();
    assert_eq!(record.get("Spawn"), Some(FieldValue::Pose(pose)));

    // Quantized once, by the save below.
    record.set("Tint", color).unwrap();

    sockets.close(5).await.unwrap();
    let reloaded = sockets.request_record(player).await.unwrap().unwrap();

    assert_eq!(reloaded.get("Spawn"), Some(FieldValue::Pose(pose)));
    let restored = *reloaded.get("Tint").unwrap().as_color().unwrap();
    for (before, after) in color.channels().iter().zip(restored.channels()) {
        assert!((before - after).abs() <= 1.0 / 255.0 + 1e-12);
    }
}

#[tokio::test]
async fn test_concurrent_opens_share_one_session() {
    let (sockets, _network) = setup();
    let player = Player::shared(6, "Twin", 30);

    let opens = (0..10).map(|_| sockets.open(player.clone()));
    let sessions = futures::future::join_all(opens).await;

    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }
    assert_eq!(sockets.session_count().await, 1);
}

#[tokio::test]
async fn test_constructed_precedes_changed() {
    let (sockets, _network) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    sockets.constructed().connect(move |event| {
        sink.lock().unwrap().push("constructed".to_string());
        event.record.set("loginAmount", 1).unwrap();
    });
    let sink = events.clone();
    sockets.changed().connect(move |event| {
        sink.lock().unwrap().push(format!("changed:{}", event.key));
    });

    let player = Player::shared(8, "Order", 30);
    let record = sockets.request_record(player).await.unwrap().unwrap();
    record.set_table(true, &["Settings", "Music"]).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec!["constructed", "changed:loginAmount", "changed:Music"]
    );
}

#[tokio::test]
async fn test_close_twice_finalizes_once() {
    let (sockets, network) = setup();
    let player = Player::shared(9, "Closer", 30);
    let record = sockets.request_record(player).await.unwrap().unwrap();
    let clears = Arc::new(AtomicUsize::new(0));
    let counter = clears.clone();
    record.clears().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    sockets.close(9).await.unwrap();
    sockets.close(9).await.unwrap();

    assert_eq!(clears.load(Ordering::SeqCst), 1);
    assert!(!record.is_active());
    let stored = network.peek(&sockets.format_key(9)).await.unwrap().unwrap();
    assert!(stored.session.is_none());
}

#[tokio::test]
async fn test_rejoin_waits_for_previous_save() {
    let (sockets, network) = setup();
    sockets.constructed().connect(|event| {
        let logins = event
            .record
            .get("loginAmount")
            .and_then(|value| value.as_i64())
            .unwrap_or(0);
        event.record.set("loginAmount", logins + 1).unwrap();
    });

    let player = Player::shared(10, "Regular", 30);
    for _ in 0..3 {
        let session = sockets.handle_connect(player.clone()).await.unwrap();
        session.wait_settled().await;
        sockets.handle_disconnect(10).await.unwrap();
    }
    let record = sockets.request_record(player).await.unwrap().unwrap();

    assert_eq!(record.get("loginAmount"), Some(FieldValue::Integer(4)));
    sockets.shutdown().await;
    let stored = network.peek(&sockets.format_key(10)).await.unwrap().unwrap();
    assert_eq!(stored.fields["loginAmount"], serde_json::json!(4));
}

#[tokio::test]
async fn test_undecodable_record_kicks_and_keeps_stored_data() {
    let (sockets, network) = setup();
    let key = sockets.format_key(11);
    let blob = serde_json::json!({
        "fields": { "loginAmount": 3, "Tint": { "Red": "bright" } },
        "saved_at": "2026-01-01T00:00:00Z"
    });
    network
        .put_raw(&key, BlobSlot::Primary, blob.to_string().as_bytes())
        .await
        .unwrap();

    let player = Player::shared(11, "Broken", 30);
    let session = sockets.handle_connect(player.clone()).await.unwrap();

    assert_eq!(session.wait_settled().await, SessionState::Failed);
    let (_, no_record) = Rule::NoRecord.messages("Broken");
    assert_eq!(player.kick_messages(), vec![no_record]);
    assert!(!player.has_tag(DATA_LOADED_TAG));
    assert!(!sockets.has_session(11).await);
    assert!(network.get_cached_record(&key).is_none());
    let stored = network.peek(&key).await.unwrap().unwrap();
    assert!(stored.session.is_none());
    assert_eq!(stored.fields["loginAmount"], serde_json::json!(3));
}

#[tokio::test]
async fn test_listen_for_players_follows_roster() {
    let (sockets, network) = setup();
    let roster = Arc::new(Roster::new());
    roster.join(Player::shared(20, "Early", 30));
    let listener = sockets.listen_for_players(roster.clone());

    roster.join(Player::shared(21, "Late", 30));
    roster.join(Player::shared(22, "Young", 1));

    eventually(|| {
        let sockets = sockets.clone();
        async move {
            sockets.session_state(20).await == Some(SessionState::Active)
                && sockets.session_state(21).await == Some(SessionState::Active)
        }
    })
    .await;
    assert!(!sockets.has_session(22).await);

    roster.leave(20);
    eventually(|| {
        let sockets = sockets.clone();
        async move { !sockets.has_session(20).await }
    })
    .await;
    let key = sockets.format_key(20);
    eventually(|| {
        let network = network.clone();
        let key = key.clone();
        async move {
            match network.peek(&key).await {
                Ok(Some(stored)) => stored.session.is_none(),
                _ => false,
            }
        }
    })
    .await;

    listener.abort();
    sockets.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_saves_everyone_and_refuses_newcomers() {
    let (sockets, network) = setup();
    let player = Player::shared(30, "Stayer", 30);
    let record = sockets.request_record(player.clone()).await.unwrap().unwrap();
    record.set("loginAmount", 12).unwrap();

    sockets.shutdown().await;

    assert_eq!(sockets.session_count().await, 0);
    let stored = network.peek(&sockets.format_key(30)).await.unwrap().unwrap();
    assert_eq!(stored.fields["loginAmount"], serde_json::json!(12));
    assert!(stored.session.is_none());

    let late = Player::shared(31, "Late", 30);
    assert!(sockets.handle_connect(late.clone()).await.is_none());
    let (_, shutting_down) = Rule::ShuttingDown.messages("Late");
    assert_eq!(late.kick_messages(), vec![shutting_down]);
    assert!(matches!(
        sockets.request_record(late).await,
        Err(DataError::EligibilityViolation(Rule::ShuttingDown))
    ));
}

#[tokio::test]
async fn test_request_wipe_resets_to_defaults() {
    let (sockets, network) = setup();
    let player = Player::shared(40, "Wiped", 30);
    let record = sockets.request_record(player.clone()).await.unwrap().unwrap();
    record.set("loginAmount", 99).unwrap();
    record.save(false).await.unwrap();

    assert!(sockets.request_wipe(player).await.unwrap());

    assert_eq!(record.get("loginAmount"), Some(FieldValue::Integer(0)));
    assert!(matches!(record.get("Tint"), Some(FieldValue::Color(_))));
    let key = sockets.format_key(40);
    assert!(network.peek(&key).await.unwrap().is_none());
    assert!(network.get_raw(&key, BlobSlot::Backup).await.unwrap().is_none());
}

#[tokio::test]
async fn test_request_after_disconnect_gets_fresh_record() {
    let (sockets, network) = setup();
    let player = Player::shared(12, "Returner", 30);
    let first = sockets.request_record(player.clone()).await.unwrap().unwrap();
    first.set("loginAmount", 7).unwrap();

    sockets.handle_disconnect(12).await.unwrap();
    let second = sockets.request_record(player).await.unwrap().unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(second.get("loginAmount"), Some(FieldValue::Integer(7)));
    let stored = network.peek(&sockets.format_key(12)).await.unwrap().unwrap();
    assert_eq!(stored.session.unwrap().job_id, network.job_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_during_activation_see_constructed_first() {
    let (sockets, _network) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    sockets.constructed().connect(move |_| {
        sink.lock().unwrap().push("constructed".to_string());
    });
    let sink = events.clone();
    sockets.changed().connect(move |event| {
        sink.lock().unwrap().push(format!("changed:{}", event.key));
    });

    let player = Arc::new(SlowTagPlayer {
        inner: Player::new(13, "Patient", 30),
        delay: Duration::from_millis(300),
    });
    let requests = (0..3).map(|_| {
        let sockets = sockets.clone();
        let player = player.clone();
        tokio::spawn(async move { sockets.request_record(player).await })
    });
    let records = futures::future::join_all(requests).await;

    for (index, record) in records.into_iter().enumerate() {
        let record = record.unwrap().unwrap().unwrap();
        assert_eq!(events.lock().unwrap()[0], "constructed");
        record.set("loginAmount", index as i64).unwrap();
    }

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "constructed",
            "changed:loginAmount",
            "changed:loginAmount",
            "changed:loginAmount"
        ]
    );
    assert!(player.has_tag(DATA_LOADED_TAG));
}
