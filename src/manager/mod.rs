// ============================================================================
// Lifecycle Manager
// ============================================================================
//
// `DataSockets` turns membership events into record sessions:
//
//   connect     -> eligibility check -> open session -> async load
//                  -> reconcile + decode -> Active -> `constructed`
//   disconnect  -> detach -> (abort pending load) -> encode + finalize
//                  -> release scope -> Closed
//
// The session table is the only state shared across participants. A
// participant has at most one live session; a new one for the same
// identity does not start loading until every earlier session for that
// identity has finished closing.
//
// ============================================================================

use crate::config::DataOptions;
use crate::core::{DataError, FieldMap, FieldValue, Result};
use crate::record::Record;
use crate::rules::{EligibilityRules, RecordPresence, Rule, ShutdownFlag, Verdict};
use crate::schema::{self, TemplateNode};
use crate::session::{
    DATA_LOADED_TAG, ParticipantRef, RecordSession, SessionEvent, SessionSource, SessionState,
    SessionTable,
};
use crate::signal::Signal;
use crate::storage::{DataNetwork, LoadFallback, LoadIssue, StorageBackend};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, Level, event, info_span};

/// Payload of [`DataSockets::constructed`].
#[derive(Clone)]
pub struct Constructed {
    pub participant: ParticipantRef,
    pub record: Arc<Record>,
}

/// Payload of [`DataSockets::changed`].
#[derive(Clone)]
pub struct DataChanged {
    pub participant: ParticipantRef,
    /// Last segment of `path`.
    pub key: String,
    pub path: Vec<String>,
    pub value: FieldValue,
}

struct LoadFailed {
    rule: Rule,
    record: Option<Arc<Record>>,
    cause: Option<DataError>,
}

impl LoadFailed {
    fn absent(rule: Rule) -> Self {
        Self {
            rule,
            record: None,
            cause: None,
        }
    }
}

pub struct DataSockets {
    options: DataOptions,
    backend: Arc<dyn StorageBackend>,
    rules: EligibilityRules,
    sessions: AsyncMutex<SessionTable>,
    constructed: Signal<Constructed>,
    changed: Signal<DataChanged>,
    autosave: Mutex<Option<AbortHandle>>,
}

impl DataSockets {
    /// Wraps an existing backend. Load issues fall back to backup data.
    pub fn new(options: DataOptions, backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        Self::with_shutdown_flag(options, backend, ShutdownFlag::new())
    }

    pub fn with_shutdown_flag(
        options: DataOptions,
        backend: Arc<dyn StorageBackend>,
        shutdown: ShutdownFlag,
    ) -> Arc<Self> {
        backend.set_fallback_policy(Arc::new(|_: &LoadIssue| LoadFallback::LoadBackup));
        let rules = EligibilityRules::new(options.min_account_age_days, shutdown);
        Arc::new(Self {
            options,
            backend,
            rules,
            sessions: AsyncMutex::new(SessionTable::new()),
            constructed: Signal::new(),
            changed: Signal::new(),
            autosave: Mutex::new(None),
        })
    }

    /// Resolves the default shape from `structure` and `overrides`, builds
    /// a [`DataNetwork`] for it and starts autosave when configured.
    ///
    /// Must be called inside a tokio runtime when autosave is enabled.
    ///
    /// ```
    /// use datasockets::{DataOptions, DataSockets, Player, TemplateKind, TemplateNode};
    /// # tokio_test::block_on(async {
    /// let structure = vec![TemplateNode::new("loginAmount", TemplateKind::IntValue(0))];
    /// let sockets = DataSockets::import_network(DataOptions::default(), &structure, &[]).unwrap();
    ///
    /// let record = sockets.request_record(Player::shared(1, "Ada", 30)).await.unwrap().unwrap();
    /// assert_eq!(record.get("loginAmount").and_then(|v| v.as_i64()), Some(0));
    /// sockets.shutdown().await;
    /// # });
    /// ```
    pub fn import_network(
        options: DataOptions,
        structure: &[TemplateNode],
        overrides: &[FieldMap],
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let shape = schema::resolve_structure(structure, overrides);
        let network = DataNetwork::new(&options, shape);
        let autosave = options
            .autosave_duration()
            .map(|interval| network.spawn_autosave(interval).abort_handle());

        let manager = Self::new(options, network);
        *manager.lock_autosave() = autosave;
        info!(
            "Data network '{}' ready (data dir: {})",
            manager.options.name,
            manager
                .options
                .data_dir
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| "memory".to_string())
        );
        Ok(manager)
    }

    pub fn options(&self) -> &DataOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        self.rules.shutdown_flag()
    }

    /// Fired once per session when its record becomes usable.
    pub fn constructed(&self) -> &Signal<Constructed> {
        &self.constructed
    }

    /// Record updates of constructed sessions.
    pub fn changed(&self) -> &Signal<DataChanged> {
        &self.changed
    }

    pub fn format_key(&self, user_id: u64) -> String {
        self.options.format_key(user_id)
    }

    pub async fn has_session(&self, user_id: u64) -> bool {
        self.sessions.lock().await.live(user_id).is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.live_count()
    }

    pub async fn session_state(&self, user_id: u64) -> Option<SessionState> {
        self.sessions
            .lock()
            .await
            .live(user_id)
            .map(|session| session.state())
    }

    /// Checks eligibility and opens a session. Ineligible participants are
    /// kicked and get no session.
    pub async fn handle_connect(
        self: &Arc<Self>,
        participant: ParticipantRef,
    ) -> Option<Arc<RecordSession>> {
        if let Verdict::Violation(rule) =
            self.rules.evaluate(participant.as_ref(), RecordPresence::Pending)
        {
            self.reject(&participant, rule, None);
            return None;
        }
        Some(self.open(participant).await)
    }

    /// Detaches the participant's session now and finalizes it in the
    /// background. Returns the finalization task, if there was a session.
    pub async fn handle_disconnect(self: &Arc<Self>, user_id: u64) -> Option<JoinHandle<Result<()>>> {
        let (session, was_loading) = self.detach(user_id).await?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            manager.finalize(session, was_loading).await
        }))
    }

    /// Returns the live session for the participant or starts one.
    pub async fn open(self: &Arc<Self>, participant: ParticipantRef) -> Arc<RecordSession> {
        let user_id = participant.user_id();
        let mut table = self.sessions.lock().await;
        if let Some(existing) = table.live(user_id) {
            return existing;
        }

        let key = self.options.format_key(user_id);
        let session = RecordSession::new(participant, key, table.closing(user_id));
        table.insert(Arc::clone(&session));

        let span = info_span!("datasockets.session.load", user_id, key = %session.key());
        let manager = Arc::clone(self);
        let loading = Arc::clone(&session);
        let handle = tokio::spawn(async move { manager.run_load(loading).await }.instrument(span));
        session.scope().register_task(handle.abort_handle());
        session.attach_load(handle);
        session
    }

    /// Ends the participant's session: pending loads are cancelled, a
    /// loaded record is saved and released. Does nothing without a session.
    pub async fn close(self: &Arc<Self>, user_id: u64) -> Result<()> {
        match self.detach(user_id).await {
            Some((session, was_loading)) => self.finalize(session, was_loading).await,
            None => Ok(()),
        }
    }

    /// The participant's record, loading it if needed. `None` when the
    /// record could not be made available.
    pub async fn request_record(
        self: &Arc<Self>,
        participant: ParticipantRef,
    ) -> Result<Option<Arc<Record>>> {
        let user_id = participant.user_id();
        let live = self.sessions.lock().await.live(user_id);
        if let Some(session) = live {
            return Ok(Self::settled_record(&session).await);
        }

        // A cached record without a live session belongs to a session that
        // is still closing; `open` waits for it instead of handing it out.
        if self.shutdown_flag().is_raised() {
            return Err(DataError::EligibilityViolation(Rule::ShuttingDown));
        }
        let session = self.open(participant).await;
        Ok(Self::settled_record(&session).await)
    }

    /// Wipes the participant's stored data. Returns false if no record
    /// could be obtained.
    pub async fn request_wipe(self: &Arc<Self>, participant: ParticipantRef) -> Result<bool> {
        match self.request_record(participant).await? {
            Some(record) => {
                record.wipe(true).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Opens sessions for everyone already connected, then follows the
    /// source's membership events until it goes away.
    pub fn listen_for_players(self: &Arc<Self>, source: Arc<dyn SessionSource>) -> JoinHandle<()> {
        let mut events = source.subscribe();
        let present = source.participants();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            for participant in present {
                manager.handle_connect(participant).await;
            }
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Joined(participant) => {
                        manager.handle_connect(participant).await;
                    }
                    SessionEvent::Leaving(participant) => {
                        manager.handle_disconnect(participant.user_id()).await;
                    }
                }
            }
        })
    }

    /// Refuses new sessions and closes every open one, saving its record.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown_flag().raise();
        if let Some(autosave) = self.lock_autosave().take() {
            autosave.abort();
        }

        let (live, closing) = {
            let table = self.sessions.lock().await;
            (table.live_sessions(), table.closing_sessions())
        };
        info!("Shutting down: closing {} session(s)", live.len());

        let closes = live.iter().map(|session| self.close(session.user_id()));
        for result in futures::future::join_all(closes).await {
            if let Err(err) = result {
                error!("Failed to close session during shutdown: {}", err);
            }
        }
        for session in closing {
            session.wait_closed().await;
        }
    }

    async fn run_load(self: Arc<Self>, session: Arc<RecordSession>) {
        for predecessor in session.take_predecessors() {
            event!(Level::DEBUG, "waiting for previous session to close");
            predecessor.wait_closed().await;
        }

        match self.load_and_prepare(&session).await {
            Ok(record) => self.activate(&session, record),
            Err(failed) => self.fail(&session, failed).await,
        }
    }

    async fn load_and_prepare(
        &self,
        session: &Arc<RecordSession>,
    ) -> std::result::Result<Arc<Record>, LoadFailed> {
        let loaded = self
            .backend
            .load_record(session.key(), self.options.load_method, false)
            .await;
        let record = match loaded {
            Ok(record) => record,
            Err(err) => {
                return Err(LoadFailed {
                    rule: Rule::NoRecord,
                    record: None,
                    cause: Some(err),
                });
            }
        };

        let presence = RecordPresence::of(record.as_ref());
        if let Verdict::Violation(rule) =
            self.rules.evaluate(session.participant().as_ref(), presence)
        {
            return Err(LoadFailed {
                rule,
                record,
                cause: None,
            });
        }
        let Some(record) = record else {
            return Err(LoadFailed::absent(Rule::NoRecord));
        };

        session.set_record(Arc::clone(&record));
        let prepared = record
            .reconcile(&self.backend.default_shape())
            .and_then(|_| record.deserialize());
        match prepared {
            Ok(()) => Ok(record),
            Err(err) => Err(LoadFailed {
                rule: Rule::NoRecord,
                record: Some(record),
                cause: Some(err),
            }),
        }
    }

    fn activate(self: &Arc<Self>, session: &Arc<RecordSession>, record: Arc<Record>) {
        let manager = Arc::downgrade(self);
        let relay_session = Arc::downgrade(session);
        let participant = Arc::clone(session.participant());
        let relay = record.updates().connect(move |update| {
            let (Some(manager), Some(session)) = (manager.upgrade(), relay_session.upgrade())
            else {
                return;
            };
            if !session.is_announced() {
                return;
            }
            manager.changed.fire(&DataChanged {
                participant: Arc::clone(&participant),
                key: update.key.clone(),
                path: update.path.clone(),
                value: update.value.clone(),
            });
        });
        session.scope().register_connection(relay);

        if !session.transition(SessionState::Active) {
            // Closed while loading; the close finalizes the record.
            return;
        }
        // A close from here on waits for this task before saving, so
        // `constructed` is always delivered ahead of the final save.
        let participant = session.participant();
        participant.add_tag(DATA_LOADED_TAG);
        session.mark_announced();
        event!(Level::INFO, user_id = participant.user_id(), "record constructed");
        self.constructed.fire(&Constructed {
            participant: Arc::clone(participant),
            record,
        });
        session.publish();
    }

    async fn fail(&self, session: &Arc<RecordSession>, failed: LoadFailed) {
        let detached = {
            let mut table = self.sessions.lock().await;
            session.state() == SessionState::Loading && table.detach_session(session)
        };
        if !detached {
            // Being closed; the close takes it from here.
            return;
        }

        self.reject(session.participant(), failed.rule, failed.cause.as_ref());
        if let Some(record) = failed.record {
            if let Err(err) = record.discard().await {
                warn!("Failed to release '{}': {}", session.key(), err);
            }
        }

        self.sessions.lock().await.remove_closing(session);
        session.transition(SessionState::Failed);
        session.scope().release_all();
    }

    fn reject(&self, participant: &ParticipantRef, rule: Rule, cause: Option<&DataError>) {
        let (server, user) = rule.messages(participant.display_name());
        match cause {
            Some(cause) => error!("[rule {}] {} ({})", rule.code(), server, cause),
            None => warn!("[rule {}] {}", rule.code(), server),
        }
        participant.kick(&user);
    }

    async fn detach(&self, user_id: u64) -> Option<(Arc<RecordSession>, bool)> {
        let mut table = self.sessions.lock().await;
        let session = table.detach(user_id)?;
        let was_loading = session.state() == SessionState::Loading;
        session.transition(SessionState::Finalizing);
        Some((session, was_loading))
    }

    async fn finalize(&self, session: Arc<RecordSession>, was_loading: bool) -> Result<()> {
        if let Some(load) = session.take_load() {
            if was_loading {
                load.abort();
            }
            match load.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    event!(Level::DEBUG, user_id = session.user_id(), "load cancelled");
                }
                Err(err) => warn!("Load task for '{}' panicked: {}", session.key(), err),
            }
        }

        let result = match self.backend.get_cached_record(session.key()) {
            Some(record) => self.save_and_release(&record).await,
            None => Ok(()),
        };
        if let Err(err) = &result {
            error!("Failed to save data for '{}': {}", session.key(), err);
        }

        session.scope().release_all();
        session.transition(SessionState::Closed);
        self.sessions.lock().await.remove_closing(&session);
        result
    }

    async fn save_and_release(&self, record: &Arc<Record>) -> Result<()> {
        record.serialize()?;
        self.backend.finalize_record(record).await
    }

    async fn settled_record(session: &Arc<RecordSession>) -> Option<Arc<Record>> {
        match session.wait_settled().await {
            SessionState::Active => session.record(),
            _ => None,
        }
    }

    fn lock_autosave(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.autosave.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for DataSockets {
    fn drop(&mut self) {
        if let Some(autosave) = self.lock_autosave().take() {
            autosave.abort();
        }
    }
}
