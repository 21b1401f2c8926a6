//! End-to-end tests across the compaction engine, pending state and
//! session orchestrator, using in-memory collaborator fakes and a real
//! temp directory for the pending-state document.

use async_trait::async_trait;
use condense::compaction::{
    CompactionEngine, PENDING_STATE_FILE_NAME, PendingStateStore, StreamEndEvent,
};
use condense::errors::{ModelError, SessionError, StoreError};
use condense::message::{AgentMeta, CompactionSource, CompactionTrigger, ContentPart, Message, Role};
use condense::session::SessionOrchestrator;
use condense::stores::{
    ChatEvent, EventBus, FinishReason, GenerateRequest, GenerateResponse, HistoryStore,
    ModelClient, PartialStreamStore, StoreResult, TokenUsage,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const SESSION: &str = "session-1";
const WORKSPACE: &str = "workspace-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Fakes

#[derive(Default)]
struct MemoryHistory {
    messages: StdMutex<Vec<Message>>,
    next_sequence: StdMutex<u64>,
    fail_clear: StdMutex<bool>,
}

impl MemoryHistory {
    fn seed(&self, messages: Vec<Message>) {
        for message in messages {
            let mut all = self.messages.lock().unwrap();
            let mut seq = self.next_sequence.lock().unwrap();
            let mut message = message;
            message.meta.history_sequence = *seq;
            *seq += 1;
            all.push(message);
        }
    }

    fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn get_history(&self, _session_id: &str) -> StoreResult<Vec<Message>> {
        Ok(self.snapshot())
    }

    async fn append_to_history(&self, _session_id: &str, mut message: Message) -> StoreResult<()> {
        let mut all = self.messages.lock().unwrap();
        let mut seq = self.next_sequence.lock().unwrap();
        message.meta.history_sequence = *seq;
        *seq += 1;
        all.push(message);
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> StoreResult<Vec<u64>> {
        if *self.fail_clear.lock().unwrap() {
            return Err(StoreError::new("clear_history", session_id, "disk full"));
        }
        let mut all = self.messages.lock().unwrap();
        let removed = all.iter().map(|m| m.meta.history_sequence).collect();
        all.clear();
        Ok(removed)
    }

    async fn truncate_after_message(
        &self,
        _session_id: &str,
        message_id: &str,
    ) -> StoreResult<()> {
        let mut all = self.messages.lock().unwrap();
        if let Some(pos) = all.iter().position(|m| m.id == message_id) {
            all.truncate(pos + 1);
        }
        Ok(())
    }
}

#[derive(Default)]
struct CountingPartials {
    deletes: StdMutex<usize>,
}

#[async_trait]
impl PartialStreamStore for CountingPartials {
    async fn delete_partial(&self, _session_id: &str) -> StoreResult<()> {
        *self.deletes.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBus {
    events: StdMutex<Vec<ChatEvent>>,
}

impl RecordingBus {
    fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl EventBus for RecordingBus {
    fn emit(&self, _workspace_id: &str, event: ChatEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct ScriptedModel {
    responses: StdMutex<VecDeque<Result<GenerateResponse, ModelError>>>,
    requests: StdMutex<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<GenerateResponse, ModelError>>) -> Self {
        Self {
            responses: StdMutex::new(responses.into()),
            requests: StdMutex::new(Vec::new()),
        }
    }

    fn text_response(text: &str) -> Result<GenerateResponse, ModelError> {
        Ok(GenerateResponse {
            finish_reason: FinishReason::Stop,
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> GenerateRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(
        &self,
        request: GenerateRequest,
        _cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ModelError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Provider("script exhausted".into())))
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn compaction_request(source: Option<CompactionSource>) -> Message {
    let mut message = Message::user("/compact");
    message.meta.agent_meta = Some(AgentMeta::CompactionRequest { source });
    message
}

fn edit_call(path: &str, diff: &str) -> Message {
    let mut message = Message::assistant("");
    message.parts = vec![ContentPart::ToolCall {
        id: "call".into(),
        name: "edit_file".into(),
        arguments: serde_json::json!({ "path": path, "diff": diff }),
    }];
    message
}

struct Harness {
    history: Arc<MemoryHistory>,
    partials: Arc<CountingPartials>,
    bus: Arc<RecordingBus>,
    pending: Arc<Mutex<PendingStateStore>>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        Self {
            history: Arc::new(MemoryHistory::default()),
            partials: Arc::new(CountingPartials::default()),
            bus: Arc::new(RecordingBus::default()),
            pending: Arc::new(Mutex::new(PendingStateStore::new(dir.path()))),
            dir,
        }
    }

    fn engine(&self) -> CompactionEngine {
        CompactionEngine::new(
            SESSION,
            WORKSPACE,
            self.history.clone(),
            self.partials.clone(),
            self.bus.clone(),
            self.pending.clone(),
        )
    }

    fn orchestrator(&self, model: Arc<ScriptedModel>) -> SessionOrchestrator {
        SessionOrchestrator::new(
            SESSION,
            WORKSPACE,
            self.history.clone(),
            model,
            self.bus.clone(),
            self.pending.clone(),
            Some("~/.agent/plan.md".to_string()),
        )
    }

    fn pending_file_exists(&self) -> bool {
        self.dir.path().join(PENDING_STATE_FILE_NAME).exists()
    }
}

// ---------------------------------------------------------------------------
// Compaction engine

#[tokio::test]
async fn test_compaction_replaces_history_and_persists_pending_state() {
    let h = Harness::new();
    h.history.seed(vec![
        Message::user("please build the thing"),
        edit_call("src/a.rs", "+fn a() {}"),
        compaction_request(None),
    ]);

    let mut engine = h.engine();
    let handled = engine
        .handle_completion(&StreamEndEvent {
            summary: "We built the thing; src/a.rs holds the new entry point.".into(),
        })
        .await
        .unwrap();
    assert!(handled);

    // History is now just the tagged summary.
    let history = h.history.snapshot();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].meta.compacted, Some(CompactionTrigger::User));
    assert!(history[0].text().contains("built the thing"));

    // Checkpoint deleted, pending state durable, delete+summary emitted.
    assert_eq!(*h.partials.deletes.lock().unwrap(), 1);
    assert!(h.pending_file_exists());
    let events = h.bus.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ChatEvent::HistoryRemoved { sequences } if sequences.len() == 3));
    assert!(matches!(&events[1], ChatEvent::Message { .. }));
}

#[tokio::test]
async fn test_compaction_is_idempotent_per_request() {
    let h = Harness::new();
    let request = compaction_request(None);
    h.history.seed(vec![Message::user("hi"), request.clone()]);

    let mut engine = h.engine();
    let event = StreamEndEvent {
        summary: "Short summary.".into(),
    };
    assert!(engine.handle_completion(&event).await.unwrap());
    let events_after_first = h.bus.count();
    let history_after_first = h.history.snapshot().len();

    // After the clear the request is gone from history: re-delivery finds
    // no unprocessed request at all.
    assert!(!engine.handle_completion(&event).await.unwrap());

    // And if the same request message somehow reappears (a replayed append
    // with the same id), the processed set absorbs it with zero effects.
    h.history.seed(vec![request]);
    assert!(engine.handle_completion(&event).await.unwrap());
    assert_eq!(h.bus.count(), events_after_first);
    assert_eq!(h.history.snapshot().len(), history_after_first + 1);
}

#[tokio::test]
async fn test_unusable_summary_leaves_request_unprocessed() {
    let h = Harness::new();
    h.history.seed(vec![Message::user("hi"), compaction_request(None)]);
    let mut engine = h.engine();

    for bad in ["", "   \n ", r#"{"tool": "compact", "args": {}}"#] {
        let handled = engine
            .handle_completion(&StreamEndEvent {
                summary: bad.into(),
            })
            .await
            .unwrap();
        assert!(!handled, "summary {bad:?} must not be accepted");
    }
    assert_eq!(h.history.snapshot().len(), 2);
    assert_eq!(h.bus.count(), 0);
    assert!(!h.pending_file_exists());

    // A good retry then succeeds against the same request.
    assert!(
        engine
            .handle_completion(&StreamEndEvent {
                summary: "A real summary.".into()
            })
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_failed_clear_rolls_back_pending_state() {
    let h = Harness::new();
    h.history.seed(vec![
        edit_call("src/a.rs", "+x"),
        compaction_request(None),
    ]);
    *h.history.fail_clear.lock().unwrap() = true;

    let mut engine = h.engine();
    let result = engine
        .handle_completion(&StreamEndEvent {
            summary: "Summary.".into(),
        })
        .await;
    assert!(result.is_err());
    // The persisted file must not survive, or the next turn would reinject
    // attachments for a compaction that never happened.
    assert!(!h.pending_file_exists());
    assert_eq!(h.bus.count(), 0);
    assert_eq!(h.history.snapshot().len(), 2);
}

#[tokio::test]
async fn test_idle_compaction_timestamp_and_tag() {
    use chrono::{TimeZone, Utc};

    let h = Harness::new();
    let mut old_user = Message::user("last real activity");
    old_user.meta.timestamp = Utc.timestamp_opt(1_000, 0).unwrap();
    let mut request = compaction_request(Some(CompactionSource::IdleCompaction));
    request.meta.timestamp = Utc.timestamp_opt(99_999, 0).unwrap();
    h.history.seed(vec![old_user, request]);

    let mut engine = h.engine();
    assert!(
        engine
            .handle_completion(&StreamEndEvent {
                summary: "Idle summary.".into()
            })
            .await
            .unwrap()
    );

    let history = h.history.snapshot();
    assert_eq!(history[0].meta.compacted, Some(CompactionTrigger::Idle));
    // Dormant workspace stays dormant: summary carries the old user
    // timestamp, not the request's fresh one.
    assert_eq!(history[0].meta.timestamp, Utc.timestamp_opt(1_000, 0).unwrap());
}

#[tokio::test]
async fn test_non_request_latest_message_is_noop() {
    let h = Harness::new();
    h.history.seed(vec![Message::user("just chatting")]);
    let mut engine = h.engine();
    assert!(
        !engine
            .handle_completion(&StreamEndEvent {
                summary: "Summary.".into()
            })
            .await
            .unwrap()
    );
    assert_eq!(h.bus.count(), 0);
}

// ---------------------------------------------------------------------------
// Reinjection + retry

#[tokio::test]
async fn test_first_turn_after_compaction_reinjects_attachments() {
    let h = Harness::new();
    h.history.seed(vec![
        edit_call("src/a.rs", "+fn a() {}"),
        compaction_request(None),
    ]);
    let mut engine = h.engine();
    engine
        .handle_completion(&StreamEndEvent {
            summary: "Summary.".into(),
        })
        .await
        .unwrap();

    let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::text_response(
        "continuing from the summary",
    )]));
    let orchestrator = h.orchestrator(model.clone());

    let outcome = orchestrator.send_message("keep going").await.unwrap();
    assert!(outcome.attachments_reinjected);
    assert!(!outcome.retried_without_attachments);

    // The model saw a synthetic attachment message with plan + diff,
    // anchored before the user turn.
    let request = model.request(0);
    let synthetic_index = request
        .messages
        .iter()
        .position(|m| m.meta.synthetic)
        .expect("attachments present");
    let user_index = request
        .messages
        .iter()
        .position(|m| m.text() == "keep going")
        .unwrap();
    assert_eq!(synthetic_index + 1, user_index);
    let attachment_text = request.messages[synthetic_index].text();
    assert!(attachment_text.contains("~/.agent/plan.md"));
    assert!(attachment_text.contains("src/a.rs"));

    // Consumed: the file is gone and the next turn carries nothing.
    assert!(!h.pending_file_exists());
    let model2 = Arc::new(ScriptedModel::new(vec![ScriptedModel::text_response("ok")]));
    let orchestrator2 = h.orchestrator(model2.clone());
    orchestrator2.send_message("next").await.unwrap();
    assert!(model2.request(0).messages.iter().all(|m| !m.meta.synthetic));
}

#[tokio::test]
async fn test_context_exceeded_retries_once_without_attachments() {
    let h = Harness::new();
    h.history.seed(vec![
        edit_call("src/a.rs", "+fn a() {}"),
        compaction_request(None),
    ]);
    h.engine()
        .handle_completion(&StreamEndEvent {
            summary: "Summary.".into(),
        })
        .await
        .unwrap();

    let model = Arc::new(ScriptedModel::new(vec![
        Err(ModelError::ContextExceeded),
        ScriptedModel::text_response("fits now"),
    ]));
    let orchestrator = h.orchestrator(model.clone());

    let outcome = orchestrator.send_message("keep going").await.unwrap();
    assert!(outcome.retried_without_attachments);
    assert_eq!(outcome.assistant.text(), "fits now");
    assert_eq!(model.request_count(), 2);

    // First call had attachments, the retry did not.
    assert!(model.request(0).messages.iter().any(|m| m.meta.synthetic));
    assert!(model.request(1).messages.iter().all(|m| !m.meta.synthetic));

    // Pending state is discarded for good, never retried again.
    assert!(!h.pending_file_exists());
}

#[tokio::test]
async fn test_second_context_exceeded_is_surfaced() {
    let h = Harness::new();
    h.history.seed(vec![
        edit_call("src/a.rs", "+x"),
        compaction_request(None),
    ]);
    h.engine()
        .handle_completion(&StreamEndEvent {
            summary: "Summary.".into(),
        })
        .await
        .unwrap();

    let model = Arc::new(ScriptedModel::new(vec![
        Err(ModelError::ContextExceeded),
        Err(ModelError::ContextExceeded),
    ]));
    let orchestrator = h.orchestrator(model.clone());

    let err = orchestrator.send_message("keep going").await.unwrap_err();
    assert!(matches!(err, SessionError::ContextExceeded));
    assert_eq!(model.request_count(), 2);
    assert!(!h.pending_file_exists());
}

#[tokio::test]
async fn test_context_exceeded_without_attachments_not_retried() {
    let h = Harness::new();
    let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::ContextExceeded)]));
    let orchestrator = h.orchestrator(model.clone());

    let err = orchestrator.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::ContextExceeded));
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_crash_recovery_reinjects_from_disk() {
    // Simulate a crash between "history cleared" and "attachments
    // consumed": the pending file exists, all in-memory state is gone.
    let h = Harness::new();
    {
        let mut store = PendingStateStore::new(h.dir.path());
        store
            .persist(condense::compaction::PendingPostCompaction::new(vec![
                condense::compaction::FileEditDiff::new("src/a.rs", "+recovered"),
            ]))
            .await
            .unwrap();
    }

    let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::text_response("ok")]));
    let orchestrator = h.orchestrator(model.clone());
    let outcome = orchestrator.send_message("resume").await.unwrap();
    assert!(outcome.attachments_reinjected);
    assert!(
        model.request(0).messages.iter().any(|m| m.text().contains("+recovered")),
        "diff recovered from disk must reach the model"
    );
    assert!(!h.pending_file_exists());
}

// ---------------------------------------------------------------------------
// Disposal

#[tokio::test]
async fn test_disposed_orchestrator_rejects_sends() {
    let h = Harness::new();
    let model = Arc::new(ScriptedModel::new(vec![]));
    let orchestrator = h.orchestrator(model.clone());

    orchestrator.dispose();
    let err = orchestrator.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::Disposed));
    assert_eq!(model.request_count(), 0);
    assert!(h.history.snapshot().is_empty());
}

#[tokio::test]
async fn test_disposal_mid_turn_suppresses_events() {
    // The model receives the session's cancellation token; cancelling it
    // mid-call simulates a disposal that lands while the stream is in
    // flight but before the response is handled.
    struct DisposingModel;

    #[async_trait]
    impl ModelClient for DisposingModel {
        async fn generate(
            &self,
            _request: GenerateRequest,
            cancel: &CancellationToken,
        ) -> Result<GenerateResponse, ModelError> {
            cancel.cancel();
            Ok(GenerateResponse {
                finish_reason: FinishReason::Stop,
                text: "too late".into(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
            })
        }
    }

    let h = Harness::new();
    let orchestrator = SessionOrchestrator::new(
        SESSION,
        WORKSPACE,
        h.history.clone(),
        Arc::new(DisposingModel),
        h.bus.clone(),
        h.pending.clone(),
        None,
    );

    let err = orchestrator.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::Disposed));
    // The response arrived after disposal began: no assistant append, no
    // forwarded event.
    assert_eq!(h.bus.count(), 0);
    let history = h.history.snapshot();
    assert!(history.iter().all(|m| m.role != Role::Assistant));
}
