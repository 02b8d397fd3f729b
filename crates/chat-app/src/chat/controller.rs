use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use natter_llm::{ChunkSource, ProviderConfig, StreamChunk, StreamRequest};
use natter_storage::{SessionId, StorageError};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::database::SessionRepository;
use crate::settings::{ModelConfig, ModelConfigStore, ProviderRegistry};

use super::message::{ChatMessage, NoticeKind};
use super::session::ChatSession;
use super::stream::{GenerationId, StreamOutcome, StreamState, StreamTarget, StreamTransition};

pub const TRANSPORT_NOTICE_CODE: &str = "stream-failed";
pub const STORAGE_NOTICE_CODE: &str = "save-failed";

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("session {session_id} is already streaming on `{stage}`"))]
    AlreadyStreaming {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session {session_id} has been removed on `{stage}`"))]
    SessionRemoved {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("generation task for session {session_id} failed on `{stage}`: {source}"))]
    Worker {
        stage: &'static str,
        session_id: SessionId,
        source: tokio::task::JoinError,
    },
}

/// What a finished generation left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub target: StreamTarget,
    pub outcome: StreamOutcome,
    /// Session as it stood after finalization, without loading entries.
    pub session: ChatSession,
    /// False when the session write failed even after the retry.
    pub persisted: bool,
}

/// Live state of one session while the controller knows about it.
struct SessionSlot {
    state: StreamState,
    session: ChatSession,
    cancel: Option<CancellationToken>,
    updates: watch::Sender<ChatSession>,
    /// Generation tasks that have not finished persisting yet.
    workers: watch::Sender<usize>,
    /// Set once the session is being deleted; no generation may start.
    retired: bool,
}

impl SessionSlot {
    fn new(session: ChatSession) -> Self {
        let (updates, _) = watch::channel(session.clone());
        let (workers, _) = watch::channel(0);
        Self {
            state: StreamState::Idle,
            session,
            cancel: None,
            updates,
            workers,
            retired: false,
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.session.clone());
    }

    /// Closes generation `target` with `outcome` and settles to idle.
    ///
    /// Returns false when `target` is no longer the active generation.
    fn finish(&mut self, target: StreamTarget, outcome: &StreamOutcome) -> bool {
        let transition = match outcome {
            StreamOutcome::Completed => StreamTransition::Complete(target),
            StreamOutcome::Aborted => StreamTransition::Abort(target),
            StreamOutcome::Errored { message } => StreamTransition::Fail {
                target,
                message: message.clone(),
            },
        };
        let Ok(terminal) = self.state.apply(transition) else {
            return false;
        };

        self.session.clear_loading();
        match terminal.outcome() {
            Some(StreamOutcome::Completed) => self.session.seal_assistant_reply(false),
            Some(StreamOutcome::Aborted) => self.session.seal_assistant_reply(true),
            // Content already applied stays, still marked partial.
            Some(StreamOutcome::Errored { message }) => {
                self.session.push(ChatMessage::notice_with_code(
                    NoticeKind::TransportError,
                    message,
                    TRANSPORT_NOTICE_CODE,
                ))
            }
            None => {}
        }

        self.state = terminal.apply(StreamTransition::Settle).unwrap_or_default();
        self.cancel = None;
        self.publish();
        true
    }
}

/// Runs at most one generation per session.
///
/// Sessions are independent: different sessions may stream at the same time.
/// Each generation is a tokio task that owns the chunk stream; the session
/// itself lives in a slot shared with the handle, so `abort` takes effect
/// immediately while the task notices at its next suspension point.
pub struct StreamController {
    source: Arc<dyn ChunkSource>,
    sessions: Arc<SessionRepository>,
    model_config: Arc<ModelConfigStore>,
    providers: Arc<ProviderRegistry>,
    slots: Mutex<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    retired: Mutex<HashSet<SessionId>>,
    next_generation: AtomicU64,
}

impl StreamController {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        sessions: Arc<SessionRepository>,
        model_config: Arc<ModelConfigStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            source,
            sessions,
            model_config,
            providers,
            slots: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Appends `prompt` as a user message and starts generating a reply.
    ///
    /// Fails without touching the session when it is already streaming or
    /// has been retired. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        session: ChatSession,
        prompt: impl Into<String>,
    ) -> ControllerResult<StreamHandle> {
        let session_id = session.id;
        let generation = GenerationId(self.next_generation.fetch_add(1, Ordering::Relaxed));
        let target = StreamTarget::new(session_id, generation);
        let slot = self.slot_for(&session)?;
        let cancel = CancellationToken::new();

        let (request, updates) = {
            let mut guard = slot.lock();
            ensure!(
                !guard.retired,
                SessionRemovedSnafu {
                    stage: "start-generation",
                    session_id,
                }
            );
            let Ok(streaming) = guard.state.apply(StreamTransition::Start(target)) else {
                tracing::debug!(session_id = %session_id, "rejected re-entrant start");
                return AlreadyStreamingSnafu {
                    stage: "start-generation",
                    session_id,
                }
                .fail();
            };

            guard.state = streaming;
            guard.session = session;
            guard.session.push(ChatMessage::user(prompt));
            guard.cancel = Some(cancel.clone());
            guard.workers.send_modify(|count| *count += 1);
            guard.publish();

            let (provider_id, provider) = self.providers.active();
            let request = build_request(
                &self.model_config.config(),
                provider_id,
                provider,
                &guard.session,
            );
            (request, guard.updates.subscribe())
        };

        tracing::debug!(
            session_id = %session_id,
            generation = %generation,
            provider_id = %request.provider_id,
            model_id = %request.model_id(),
            "generation started"
        );

        let worker = GenerationWorker {
            target,
            slot: slot.clone(),
            source: self.source.clone(),
            sessions: self.sessions.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(request));

        Ok(StreamHandle {
            target,
            cancel,
            slot,
            updates,
            task,
        })
    }

    /// Aborts whatever generation `session_id` is running. No-op when idle.
    pub fn abort(&self, session_id: SessionId) -> bool {
        let Some(slot) = self.existing_slot(session_id) else {
            return false;
        };
        let Some(target) = slot.lock().state.active_target() else {
            return false;
        };
        abort_generation(&slot, target)
    }

    pub fn abort_all(&self) -> usize {
        let slots = self.slots.lock().values().cloned().collect::<Vec<_>>();
        slots
            .iter()
            .filter(|slot| {
                let target = slot.lock().state.active_target();
                target.is_some_and(|target| abort_generation(slot, target))
            })
            .count()
    }

    pub fn is_streaming(&self, session_id: SessionId) -> bool {
        self.existing_slot(session_id)
            .is_some_and(|slot| slot.lock().state.is_streaming())
    }

    pub fn state(&self, session_id: SessionId) -> StreamState {
        self.existing_slot(session_id)
            .map(|slot| slot.lock().state.clone())
            .unwrap_or_default()
    }

    /// Latest in-memory copy of a session the controller has seen.
    pub fn snapshot(&self, session_id: SessionId) -> Option<ChatSession> {
        self.existing_slot(session_id)
            .map(|slot| slot.lock().session.clone())
    }

    pub fn subscribe(&self, session_id: SessionId) -> Option<watch::Receiver<ChatSession>> {
        self.existing_slot(session_id)
            .map(|slot| slot.lock().updates.subscribe())
    }

    /// Waits until every generation task of `session_id` has finished
    /// persisting, including ones already aborted.
    pub async fn settled(&self, session_id: SessionId) {
        let Some(slot) = self.existing_slot(session_id) else {
            return;
        };
        let mut workers = slot.lock().workers.subscribe();
        // The sender lives in the slot we hold, so the channel cannot close.
        let _ = workers.wait_for(|count| *count == 0).await;
    }

    pub async fn settle_all(&self) {
        let session_ids = self.slots.lock().keys().copied().collect::<Vec<_>>();
        for session_id in session_ids {
            self.settled(session_id).await;
        }
    }

    /// Closes `session_id` for good before it is deleted.
    ///
    /// Aborts its generation, refuses every later `start`, waits until all
    /// of its generation tasks have persisted, then drops the slot.
    pub async fn retire(&self, session_id: SessionId) {
        let slot = {
            let slots = self.slots.lock();
            self.retired.lock().insert(session_id);
            slots.get(&session_id).cloned()
        };

        if let Some(slot) = slot {
            let active = {
                let mut guard = slot.lock();
                guard.retired = true;
                guard.state.active_target()
            };
            if let Some(target) = active {
                abort_generation(&slot, target);
            }
        }

        self.settled(session_id).await;
        self.slots.lock().remove(&session_id);
        tracing::debug!(session_id = %session_id, "retired session");
    }

    fn slot_for(&self, session: &ChatSession) -> ControllerResult<Arc<Mutex<SessionSlot>>> {
        let mut slots = self.slots.lock();
        ensure!(
            !self.retired.lock().contains(&session.id),
            SessionRemovedSnafu {
                stage: "start-generation",
                session_id: session.id,
            }
        );
        let slot = slots
            .entry(session.id)
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new(session.clone()))));
        Ok(slot.clone())
    }

    fn existing_slot(&self, session_id: SessionId) -> Option<Arc<Mutex<SessionSlot>>> {
        self.slots.lock().get(&session_id).cloned()
    }
}

/// Request for one generation, frozen from the config as it is right now.
pub fn build_request(
    config: &ModelConfig,
    provider_id: String,
    provider: ProviderConfig,
    session: &ChatSession,
) -> StreamRequest {
    StreamRequest::new(provider_id, provider, session.history_for_model())
        .with_preamble(config.system_prompt.clone())
        .with_temperature(config.temperature)
        .with_max_tokens(config.max_tokens)
        .with_context_balance(config.context_balance)
        .with_tools(config.tools(), config.multi_tools_enabled)
}

fn abort_generation(slot: &Mutex<SessionSlot>, target: StreamTarget) -> bool {
    let mut guard = slot.lock();
    let cancel = guard.cancel.clone();
    if !guard.finish(target, &StreamOutcome::Aborted) {
        return false;
    }

    if let Some(cancel) = cancel {
        cancel.cancel();
    }
    tracing::info!(
        session_id = %target.session_id,
        generation = %target.generation,
        "generation aborted"
    );
    true
}

/// Caller's view of a running generation.
///
/// Dropping the handle does not stop the generation.
pub struct StreamHandle {
    target: StreamTarget,
    cancel: CancellationToken,
    slot: Arc<Mutex<SessionSlot>>,
    updates: watch::Receiver<ChatSession>,
    task: JoinHandle<GenerationOutcome>,
}

impl StreamHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn session_id(&self) -> SessionId {
        self.target.session_id
    }

    /// Stops the generation. Safe to call any number of times; only the
    /// first call while streaming has an effect.
    pub fn abort(&self) -> bool {
        let aborted = abort_generation(&self.slot, self.target);
        self.cancel.cancel();
        aborted
    }

    pub fn is_streaming(&self) -> bool {
        self.slot.lock().state.accepts_stream_event(self.target)
    }

    /// Session snapshots, published after every applied chunk.
    pub fn updates(&self) -> watch::Receiver<ChatSession> {
        self.updates.clone()
    }

    pub async fn finished(self) -> ControllerResult<GenerationOutcome> {
        let session_id = self.target.session_id;
        self.task.await.context(WorkerSnafu {
            stage: "join-generation",
            session_id,
        })
    }
}

struct GenerationWorker {
    target: StreamTarget,
    slot: Arc<Mutex<SessionSlot>>,
    source: Arc<dyn ChunkSource>,
    sessions: Arc<SessionRepository>,
    cancel: CancellationToken,
}

impl GenerationWorker {
    async fn run(self, request: StreamRequest) -> GenerationOutcome {
        let outcome = self.consume(request).await;
        let (outcome, record) = self.finalize(outcome);

        let (session, persisted) = match self.sessions.save_session(&record).await {
            Ok(()) => (record, true),
            Err(error) => (self.report_storage_failure(&error), false),
        };

        tracing::info!(
            session_id = %self.target.session_id,
            generation = %self.target.generation,
            outcome = ?outcome,
            persisted,
            "generation finished"
        );
        GenerationOutcome {
            target: self.target,
            outcome,
            session,
            persisted,
        }
    }

    async fn consume(&self, request: StreamRequest) -> StreamOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StreamOutcome::Aborted,
            opened = self.source.open(request, self.cancel.clone()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    session_id = %self.target.session_id,
                    source_id = %self.source.id(),
                    error = %error,
                    "failed to open chunk stream"
                );
                return StreamOutcome::Errored {
                    message: error.to_string(),
                };
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!(session_id = %self.target.session_id, "chunk stream cancelled");
                    return StreamOutcome::Aborted;
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        if !self.apply_chunk(chunk) {
                            return StreamOutcome::Aborted;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            session_id = %self.target.session_id,
                            error = %error,
                            "chunk stream failed"
                        );
                        return StreamOutcome::Errored {
                            message: error.to_string(),
                        };
                    }
                    None => return StreamOutcome::Completed,
                }
            }
        }
    }

    fn apply_chunk(&self, chunk: StreamChunk) -> bool {
        let mut slot = self.slot.lock();
        if !slot.state.accepts_stream_event(self.target) {
            return false;
        }

        match chunk {
            StreamChunk::Delta { content } => {
                slot.session.clear_loading();
                slot.session.append_or_mutate_assistant(&content);
            }
            StreamChunk::Loading { message, progress } => {
                slot.session
                    .set_loading(ChatMessage::loading(message, progress));
            }
        }
        slot.publish();
        true
    }

    fn finalize(&self, outcome: StreamOutcome) -> (StreamOutcome, ChatSession) {
        let mut slot = self.slot.lock();
        // `abort` closes the generation itself; anything else that ended it
        // early is reported the same way.
        let outcome = if slot.finish(self.target, &outcome) {
            outcome
        } else {
            StreamOutcome::Aborted
        };
        (outcome, slot.session.persistable())
    }

    fn report_storage_failure(&self, error: &StorageError) -> ChatSession {
        tracing::error!(
            session_id = %self.target.session_id,
            error = %error,
            "failed to save session"
        );

        let mut slot = self.slot.lock();
        // A newer generation owns the tail of the session now.
        if !slot.state.is_streaming() {
            slot.session.push(ChatMessage::notice_with_code(
                NoticeKind::StorageError,
                format!("Failed to save conversation: {error}"),
                STORAGE_NOTICE_CODE,
            ));
            slot.publish();
        }
        slot.session.persistable()
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        self.slot
            .lock()
            .workers
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use natter_llm::{DEFAULT_PROVIDER_ID, ScriptStep, ScriptedSource};
    use natter_storage::{BoxFuture, KvStore, MemoryStore, Persistence, StorageResult};

    use super::*;
    use crate::chat::message::{AssistantMessage, ClientNotice};

    struct Harness {
        controller: StreamController,
        source: Arc<ScriptedSource>,
        sessions: Arc<SessionRepository>,
        model_config: Arc<ModelConfigStore>,
    }

    fn harness(source: ScriptedSource) -> Harness {
        harness_with(
            source,
            Arc::new(Persistence::in_memory()),
            ProviderConfig::default().with_api_key("sk-test"),
        )
    }

    fn harness_with(
        source: ScriptedSource,
        persistence: Arc<Persistence>,
        provider: ProviderConfig,
    ) -> Harness {
        let source = Arc::new(source);
        let sessions = Arc::new(SessionRepository::new(persistence.clone()));
        let model_config = Arc::new(ModelConfigStore::with_config(
            persistence.clone(),
            ModelConfig::default(),
        ));
        let providers = Arc::new(ProviderRegistry::with_config(
            persistence,
            DEFAULT_PROVIDER_ID,
            Default::default(),
            provider,
        ));
        Harness {
            controller: StreamController::new(
                source.clone(),
                sessions.clone(),
                model_config.clone(),
                providers,
            ),
            source,
            sessions,
            model_config,
        }
    }

    fn assistant(message: &ChatMessage) -> &AssistantMessage {
        match message {
            ChatMessage::Assistant(reply) => reply,
            other => panic!("expected assistant message, got {:?}", other.kind()),
        }
    }

    fn notice(message: &ChatMessage) -> &ClientNotice {
        match message {
            ChatMessage::ClientNotice(notice) => notice,
            other => panic!("expected client notice, got {:?}", other.kind()),
        }
    }

    async fn wait_for_text(handle: &StreamHandle, text: &str) {
        let mut updates = handle.updates();
        tokio::time::timeout(
            Duration::from_secs(2),
            updates.wait_for(|session| session.last().is_some_and(|last| last.text() == text)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    /// Rejects every write.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KvStore for ReadOnlyStore {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
            self.inner.get(key)
        }

        fn set<'a>(&'a self, key: &'a str, _value: String) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                Err(StorageError::Backend {
                    stage: "read-only-set",
                    key: key.to_string(),
                    details: "read-only volume".to_string(),
                })
            })
        }

        fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn completed_generation_concatenates_deltas() {
        let harness = harness(ScriptedSource::deltas(["Hi", " there"]));
        let session = ChatSession::new("greeting");
        let session_id = session.id;

        let handle = harness.controller.start(session, "Hello").unwrap();
        let finished = handle.finished().await.unwrap();

        assert_eq!(finished.outcome, StreamOutcome::Completed);
        assert!(finished.persisted);
        let messages = &finished.session.messages;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user());
        assert_eq!(messages[0].text(), "Hello");
        assert_eq!(assistant(&messages[1]).content, "Hi there");
        assert!(!assistant(&messages[1]).partial);

        assert_eq!(harness.controller.state(session_id), StreamState::Idle);
        let stored = harness.sessions.load_session(session_id).await.unwrap().unwrap();
        assert_eq!(stored.messages, finished.session.messages);

        let request = &harness.source.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.preamble.as_deref(), Some("You are a helpful assistant."));
    }

    #[tokio::test]
    async fn transport_failure_keeps_partial_reply_and_adds_notice() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::delta("Par")),
            ScriptStep::Fail("connection reset".to_string()),
        ]));

        let handle = harness
            .controller
            .start(ChatSession::new("t"), "Tell me")
            .unwrap();
        let finished = handle.finished().await.unwrap();

        assert!(matches!(finished.outcome, StreamOutcome::Errored { .. }));
        let messages = &finished.session.messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(assistant(&messages[1]).content, "Par");
        assert!(assistant(&messages[1]).partial);
        let notice = notice(&messages[2]);
        assert_eq!(notice.kind, NoticeKind::TransportError);
        assert!(notice.content.contains("connection reset"));
        assert_eq!(notice.code.as_deref(), Some(TRANSPORT_NOTICE_CODE));
    }

    #[tokio::test]
    async fn abort_freezes_partial_reply_and_returns_to_idle() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::delta("Par")),
            ScriptStep::Hang,
        ]));
        let session = ChatSession::new("t");
        let session_id = session.id;

        let handle = harness.controller.start(session, "go").unwrap();
        wait_for_text(&handle, "Par").await;
        assert!(harness.controller.is_streaming(session_id));

        assert!(handle.abort());
        assert_eq!(harness.controller.state(session_id), StreamState::Idle);
        assert!(!handle.is_streaming());
        let snapshot = harness.controller.snapshot(session_id).unwrap();
        assert!(assistant(snapshot.last().unwrap()).partial);

        assert!(!handle.abort());
        assert!(!harness.controller.abort(session_id));

        let finished = handle.finished().await.unwrap();
        assert_eq!(finished.outcome, StreamOutcome::Aborted);
        assert_eq!(assistant(&finished.session.messages[1]).content, "Par");
        let stored = harness.sessions.load_session(session_id).await.unwrap().unwrap();
        assert!(assistant(&stored.messages[1]).partial);
    }

    #[tokio::test]
    async fn abort_while_idle_is_a_no_op() {
        let harness = harness(ScriptedSource::deltas(["done"]));
        assert!(!harness.controller.abort(SessionId::new_v7()));

        let handle = harness
            .controller
            .start(ChatSession::new("t"), "q")
            .unwrap();
        let session_id = handle.session_id();
        let finished = {
            let mut updates = handle.updates();
            updates
                .wait_for(|session| {
                    matches!(session.last(), Some(ChatMessage::Assistant(reply)) if !reply.partial)
                })
                .await
                .unwrap();
            let before = harness.controller.snapshot(session_id);
            assert!(!handle.abort());
            assert_eq!(harness.controller.snapshot(session_id), before);
            handle.finished().await.unwrap()
        };

        assert_eq!(finished.outcome, StreamOutcome::Completed);
        assert!(!assistant(&finished.session.messages[1]).partial);
    }

    #[tokio::test]
    async fn second_start_on_same_session_is_rejected() {
        let harness = harness(ScriptedSource::new(vec![ScriptStep::Hang]));
        let session = ChatSession::new("busy");
        let session_id = session.id;

        let handle = harness.controller.start(session.clone(), "first").unwrap();
        let error = harness
            .controller
            .start(session, "second")
            .err()
            .unwrap();
        assert!(matches!(error, ControllerError::AlreadyStreaming { .. }));
        assert_eq!(harness.controller.snapshot(session_id).unwrap().messages.len(), 1);

        let other = harness
            .controller
            .start(ChatSession::new("other"), "parallel")
            .unwrap();
        assert!(harness.controller.is_streaming(other.session_id()));

        assert_eq!(harness.controller.abort_all(), 2);
        handle.finished().await.unwrap();
        other.finished().await.unwrap();
    }

    #[tokio::test]
    async fn loading_entry_is_replaced_then_removed() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::loading("searching", None)),
            ScriptStep::Chunk(StreamChunk::loading("reading", Some(0.5))),
            ScriptStep::Hang,
        ]));

        let handle = harness
            .controller
            .start(ChatSession::new("t"), "look it up")
            .unwrap();
        wait_for_text(&handle, "reading").await;

        let live = handle.updates().borrow().clone();
        assert_eq!(live.messages.len(), 2);
        assert!(live.messages[1].is_loading_chunk());

        handle.abort();
        let finished = handle.finished().await.unwrap();
        let messages = &finished.session.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(assistant(&messages[1]).content, "");
        assert!(assistant(&messages[1]).partial);
    }

    #[tokio::test]
    async fn content_chunk_clears_loading_entry() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::loading("calling tool", None)),
            ScriptStep::Chunk(StreamChunk::delta("Result")),
        ]));

        let handle = harness
            .controller
            .start(ChatSession::new("t"), "q")
            .unwrap();
        let finished = handle.finished().await.unwrap();
        assert!(finished.session.messages.iter().all(|m| !m.is_loading_chunk()));
        assert_eq!(finished.session.messages.len(), 2);
        assert_eq!(assistant(&finished.session.messages[1]).content, "Result");
    }

    #[tokio::test]
    async fn empty_sequence_yields_empty_final_reply() {
        let harness = harness(ScriptedSource::new(Vec::new()));
        let handle = harness
            .controller
            .start(ChatSession::new("t"), "q")
            .unwrap();
        let finished = handle.finished().await.unwrap();

        let reply = assistant(&finished.session.messages[1]);
        assert_eq!(reply.content, "");
        assert!(!reply.partial);
    }

    #[tokio::test]
    async fn open_failure_becomes_transport_notice() {
        let harness = harness(ScriptedSource::failing_open("503 from upstream"));
        let handle = harness
            .controller
            .start(ChatSession::new("t"), "q")
            .unwrap();
        let finished = handle.finished().await.unwrap();

        assert!(matches!(finished.outcome, StreamOutcome::Errored { .. }));
        let messages = &finished.session.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(notice(&messages[1]).kind, NoticeKind::TransportError);
    }

    #[tokio::test]
    async fn missing_api_key_is_refused_when_the_stream_opens() {
        let harness = harness_with(
            ScriptedSource::deltas(["never"]).requiring_api_key(),
            Arc::new(Persistence::in_memory()),
            ProviderConfig::default(),
        );
        let session = ChatSession::new("t");
        let session_id = session.id;

        let handle = harness.controller.start(session, "q").unwrap();
        let finished = handle.finished().await.unwrap();

        let StreamOutcome::Errored { message } = &finished.outcome else {
            panic!("expected an errored outcome, got {:?}", finished.outcome);
        };
        assert!(message.contains(DEFAULT_PROVIDER_ID));
        let messages = &finished.session.messages;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user());
        let notice = notice(&messages[1]);
        assert_eq!(notice.kind, NoticeKind::TransportError);
        assert_eq!(notice.code.as_deref(), Some(TRANSPORT_NOTICE_CODE));
        assert_eq!(harness.controller.state(session_id), StreamState::Idle);

        let request = &harness.source.requests()[0];
        assert_eq!(request.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(request.provider.api_key, None);
    }

    #[tokio::test]
    async fn config_edit_mid_stream_applies_to_next_generation() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::delta("a")),
            ScriptStep::Hang,
        ]));
        let session = ChatSession::new("t");

        let handle = harness.controller.start(session, "first").unwrap();
        wait_for_text(&handle, "a").await;
        harness.model_config.update_temperature(1.5).await.unwrap();
        handle.abort();
        let finished = handle.finished().await.unwrap();

        let next = harness
            .controller
            .start(finished.session, "second")
            .unwrap();
        next.abort();
        next.finished().await.unwrap();

        let requests = harness.source.requests();
        assert_eq!(requests[0].temperature, Some(0.7));
        // The second generation may be aborted before it opens the source.
        if let Some(second) = requests.get(1) {
            assert_eq!(second.temperature, Some(1.5));
        }
    }

    #[test]
    fn request_is_frozen_from_config_at_start() {
        let mut config = ModelConfig {
            temperature: 1.1,
            ..ModelConfig::default()
        };
        config.enabled_tools.insert("search".to_string());
        let mut session = ChatSession::new("t");
        session.push(ChatMessage::user("hi"));

        let request = build_request(
            &config,
            "deepseek".to_string(),
            ProviderConfig::default(),
            &session,
        );
        config.temperature = 0.1;

        assert_eq!(request.temperature, Some(1.1));
        assert_eq!(request.tools, vec!["search".to_string()]);
        assert_eq!(request.parallel_tool_calls, Some(false));
        assert_eq!(request.max_tokens, Some(2000));
    }

    #[tokio::test]
    async fn failed_save_appends_storage_notice() {
        let harness = harness_with(
            ScriptedSource::deltas(["ok"]),
            Arc::new(Persistence::new(Arc::new(ReadOnlyStore::default()))),
            ProviderConfig::default().with_api_key("sk-test"),
        );
        let session = ChatSession::new("t");
        let session_id = session.id;

        let handle = harness.controller.start(session, "q").unwrap();
        let finished = handle.finished().await.unwrap();

        assert!(!finished.persisted);
        assert_eq!(finished.outcome, StreamOutcome::Completed);
        let last = notice(finished.session.last().unwrap());
        assert_eq!(last.kind, NoticeKind::StorageError);
        assert_eq!(
            harness.controller.snapshot(session_id).unwrap().messages,
            finished.session.messages
        );
    }

    #[tokio::test]
    async fn settled_waits_for_aborted_generation_to_persist() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::delta("x")),
            ScriptStep::Hang,
        ]));
        let handle = harness
            .controller
            .start(ChatSession::new("t"), "q")
            .unwrap();
        let session_id = handle.session_id();
        wait_for_text(&handle, "x").await;

        assert!(harness.controller.abort(session_id));
        tokio::time::timeout(Duration::from_secs(2), harness.controller.settled(session_id))
            .await
            .unwrap();

        let stored = harness.sessions.load_session(session_id).await.unwrap().unwrap();
        assert!(assistant(&stored.messages[1]).partial);
        drop(handle);
    }

    #[tokio::test]
    async fn retired_session_refuses_new_generations() {
        let harness = harness(ScriptedSource::new(vec![
            ScriptStep::Chunk(StreamChunk::delta("x")),
            ScriptStep::Hang,
        ]));
        let session = ChatSession::new("t");
        let session_id = session.id;
        let handle = harness.controller.start(session.clone(), "q").unwrap();
        wait_for_text(&handle, "x").await;

        tokio::time::timeout(Duration::from_secs(2), harness.controller.retire(session_id))
            .await
            .unwrap();

        assert!(!handle.is_streaming());
        assert!(harness.controller.snapshot(session_id).is_none());
        let stored = harness.sessions.load_session(session_id).await.unwrap().unwrap();
        assert!(assistant(&stored.messages[1]).partial);

        let error = harness.controller.start(session, "again").err().unwrap();
        assert!(matches!(error, ControllerError::SessionRemoved { .. }));
        assert!(harness.controller.snapshot(session_id).is_none());
        assert_eq!(harness.source.requests().len(), 1);

        let finished = handle.finished().await.unwrap();
        assert_eq!(finished.outcome, StreamOutcome::Aborted);
    }

    #[tokio::test]
    async fn retiring_an_unknown_session_blocks_it_too() {
        let harness = harness(ScriptedSource::deltas(["ok"]));
        let session = ChatSession::new("t");

        harness.controller.retire(session.id).await;
        let error = harness.controller.start(session, "q").err().unwrap();
        assert!(matches!(error, ControllerError::SessionRemoved { .. }));
    }
}
