//! Session orchestrator: drives one chat turn through
//! `ResolveSession -> ProcessDocuments -> BuildContext -> StreamModel -> PersistSession`.
//!
//! `begin_turn` runs every step that can still fail with an error response.
//! It returns an `ActiveTurn` once the provider has produced its first event,
//! at which point the session id is known and the HTTP layer can commit to a
//! streamed body. `ActiveTurn::run` relays the rest and persists on success.

use futures::future::join_all;
use futures::{stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_ANALYSIS_PROMPT, DEFAULT_SYSTEM_PROMPT};
use crate::context_engine::analysis::{parse_findings, AnalysisReport, ANALYZE_INSTRUCTION};
use crate::context_engine::context_builder::merge;
use crate::context_engine::document_extractor::DocumentExtractor;
use crate::context_engine::stream_relay::{relay, ChunkSender};
use crate::document::DocumentContext;
use crate::error::{ChatError, TurnFailure};
use crate::message::Message;
use crate::metrics;
use crate::providers::{ModelProvider, ObjectStore, ProviderEvent, ProviderStream};
use crate::session_store::{
    Session, SessionStore, UsageInfo, UsageKind, UsageLedger, UsageRecord, UsageTotals,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub analysis_prompt: String,
    /// Bound on everything before the first streamed byte.
    pub pre_stream_timeout: Duration,
    pub stream_timeout: Duration,
    /// Turns allowed to hold an open model stream at once.
    pub max_concurrent_streams: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            analysis_prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
            pre_stream_timeout: Duration::from_secs(300),
            stream_timeout: Duration::from_secs(600),
            max_concurrent_streams: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            analysis_prompt: config.analysis_prompt.clone(),
            pre_stream_timeout: config.request_timeout(),
            stream_timeout: config.stream_timeout(),
            max_concurrent_streams: config.max_concurrent_streams,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    ResolveSession,
    ProcessDocuments,
    BuildContext,
    StreamModel,
    PersistSession,
    Done,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::ResolveSession => "resolve_session",
            TurnStage::ProcessDocuments => "process_documents",
            TurnStage::BuildContext => "build_context",
            TurnStage::StreamModel => "stream_model",
            TurnStage::PersistSession => "persist_session",
            TurnStage::Done => "done",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound `SendMessage`.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub owner_id: String,
    /// Forwarded to the object store on download.
    pub caller_token: String,
    pub prompt: String,
    pub session_id: Option<String>,
    pub file_paths: Vec<String>,
    pub include_images: bool,
}

/// How a streamed turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Persisted { session: Session, usage: Option<UsageInfo> },
    /// The stream failed or the caller left; nothing was saved.
    Discarded { reason: String },
    /// The caller got the answer but the session was not updated.
    PersistFailed { reason: String },
}

pub struct SessionOrchestrator {
    sessions: Arc<dyn SessionStore>,
    usage: Arc<dyn UsageLedger>,
    model: Arc<dyn ModelProvider>,
    objects: Arc<dyn ObjectStore>,
    extractor: DocumentExtractor,
    stream_slots: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl SessionOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        usage: Arc<dyn UsageLedger>,
        model: Arc<dyn ModelProvider>,
        objects: Arc<dyn ObjectStore>,
        extractor: DocumentExtractor,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            "Session orchestrator initialized (max {} concurrent streams)",
            config.max_concurrent_streams
        );
        Self {
            sessions,
            usage,
            model,
            objects,
            extractor,
            stream_slots: Arc::new(Semaphore::new(config.max_concurrent_streams.max(1))),
            config,
        }
    }

    /// Runs every step of a turn that can still fail with an error response.
    /// The returned turn holds a stream slot until `ActiveTurn::run` finishes.
    pub async fn begin_turn(&self, request: TurnRequest) -> Result<ActiveTurn, TurnFailure> {
        if request.prompt.trim().is_empty() {
            return Err(ChatError::ValidationFailed("prompt must not be empty".to_string()).into());
        }

        debug!(stage = %TurnStage::ResolveSession, "Resolving session for {}", request.owner_id);
        let session = self.resolve_or_create(&request).await?;
        let session_id = session.id.clone();

        let deadline = self.config.pre_stream_timeout;
        let (new_documents, stream, slot) = tokio::time::timeout(deadline, self.prepare_stream(&request, &session))
            .await
            .map_err(|_| ChatError::TimedOut(format!("no model output within {}s", deadline.as_secs())))
            .and_then(|prepared| prepared)
            .map_err(|e| TurnFailure::new(Some(session_id.clone()), e))?;

        Ok(ActiveTurn {
            session_id,
            owner_id: request.owner_id,
            prompt: request.prompt,
            new_documents,
            stream,
            sessions: self.sessions.clone(),
            usage: self.usage.clone(),
            stream_timeout: self.config.stream_timeout,
            _slot: slot,
        })
    }

    async fn prepare_stream(
        &self,
        request: &TurnRequest,
        session: &Session,
    ) -> Result<(Vec<DocumentContext>, ProviderStream, OwnedSemaphorePermit), ChatError> {
        debug!(stage = %TurnStage::ProcessDocuments, "Processing {} file(s)", request.file_paths.len());
        let new_documents = self.process_documents(request).await;

        debug!(stage = %TurnStage::BuildContext, "Merging context for session {}", session.id);
        let messages = merge(
            &self.config.system_prompt,
            &session.messages,
            &session.documents,
            &new_documents,
            &request.prompt,
        );

        let slot = self
            .stream_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ChatError::ModelCallFailed(e.to_string()))?;

        debug!(stage = %TurnStage::StreamModel, "Calling model with {} message(s)", messages.len());
        let stream = self.open_stream(messages).await?;
        Ok((new_documents, stream, slot))
    }

    async fn resolve_or_create(&self, request: &TurnRequest) -> Result<Session, TurnFailure> {
        let unavailable = |e: anyhow::Error| TurnFailure::from(ChatError::StoreUnavailable(e.to_string()));

        if let Some(ref id) = request.session_id {
            match self.sessions.resolve(id, &request.owner_id).await.map_err(unavailable)? {
                Some(session) => {
                    info!("Resumed session {} ({} messages)", session.id, session.messages.len());
                    return Ok(session);
                }
                None => info!("Session {} not found for caller, starting a new one", id),
            }
        }

        let session = self.sessions.create_empty(&request.owner_id).await.map_err(unavailable)?;
        info!("Created session {}", session.id);
        Ok(session)
    }

    /// Documents are extracted concurrently; a failure only drops that file.
    async fn process_documents(&self, request: &TurnRequest) -> Vec<DocumentContext> {
        let results = join_all(
            request
                .file_paths
                .iter()
                .map(|path| self.process_document(request, path)),
        )
        .await;

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(document) => Some(document),
                Err(e) => {
                    warn!("Skipping document: {}", e);
                    metrics::inc_document_failures();
                    None
                }
            })
            .collect()
    }

    async fn process_document(&self, request: &TurnRequest, path: &str) -> Result<DocumentContext, ChatError> {
        let source_name = source_name_for(path);
        let bytes = self
            .objects
            .download(&request.owner_id, path, &request.caller_token)
            .await
            .map_err(|e| ChatError::DocumentProcessingFailed {
                source_name: source_name.clone(),
                reason: format!("download failed: {}", e),
            })?;
        let mime_type = self.objects.mime_type(path);
        self.extractor
            .extract(bytes, &source_name, &mime_type, request.include_images)
            .await
    }

    /// Waits for the first provider event so that an immediate failure can
    /// still be reported as an error response.
    async fn open_stream(&self, messages: Vec<Message>) -> Result<ProviderStream, ChatError> {
        let mut events = self
            .model
            .stream_chat(messages)
            .await
            .map_err(|e| ChatError::ModelCallFailed(e.to_string()))?;

        let first: Option<anyhow::Result<ProviderEvent>> = match events.next().await {
            Some(Ok(ProviderEvent::ProviderError(message))) => return Err(ChatError::ModelCallFailed(message)),
            Some(Err(e)) => return Err(ChatError::ModelCallFailed(e.to_string())),
            Some(Ok(event)) => Some(Ok(event)),
            None => None,
        };

        Ok(stream::iter(first).chain(events).boxed())
    }

    pub async fn analyze_session(
        &self,
        owner_id: &str,
        session_id: &str,
        extra_prompt: Option<&str>,
    ) -> Result<AnalysisReport, ChatError> {
        let session = self
            .sessions
            .resolve(session_id, owner_id)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))?
            .ok_or(ChatError::SessionNotFound)?;

        if session.documents.iter().all(DocumentContext::is_empty) {
            return Err(ChatError::ValidationFailed("session has no documents to analyze".to_string()));
        }

        let instruction = match extra_prompt.map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{}\n\n{}", ANALYZE_INSTRUCTION, extra),
            _ => ANALYZE_INSTRUCTION.to_string(),
        };
        let messages = merge(&self.config.analysis_prompt, &[], &session.documents, &[], &instruction);

        info!("Analyzing {} document(s) in session {}", session.documents.len(), session.id);
        let completion = self
            .model
            .complete_json(messages)
            .await
            .map_err(|e| ChatError::ModelCallFailed(e.to_string()))?;

        if let Some(info) = completion.usage {
            record_usage(self.usage.as_ref(), owner_id, UsageKind::Analysis, info, Some(&session.id)).await;
        }

        let findings = parse_findings(&completion.json_text)?;
        Ok(AnalysisReport {
            session_id: session.id,
            findings,
            usage: completion.usage,
        })
    }

    pub async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>, ChatError> {
        self.sessions
            .list_for_owner(owner_id)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))
    }

    pub async fn get_session(&self, owner_id: &str, session_id: &str) -> Result<Session, ChatError> {
        self.sessions
            .resolve(session_id, owner_id)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))?
            .ok_or(ChatError::SessionNotFound)
    }

    pub async fn usage_totals(&self, owner_id: &str) -> Result<UsageTotals, ChatError> {
        self.usage
            .totals_for_owner(owner_id)
            .await
            .map_err(|e| ChatError::StoreUnavailable(e.to_string()))
    }
}

/// A turn whose session is resolved and whose provider stream is open.
pub struct ActiveTurn {
    session_id: String,
    owner_id: String,
    prompt: String,
    new_documents: Vec<DocumentContext>,
    stream: ProviderStream,
    sessions: Arc<dyn SessionStore>,
    usage: Arc<dyn UsageLedger>,
    stream_timeout: Duration,
    _slot: OwnedSemaphorePermit,
}

impl fmt::Debug for ActiveTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTurn")
            .field("session_id", &self.session_id)
            .field("owner_id", &self.owner_id)
            .field("new_documents", &self.new_documents.len())
            .finish_non_exhaustive()
    }
}

impl ActiveTurn {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run(self, sink: ChunkSender) -> TurnOutcome {
        let _gauge = StreamGauge::start();
        let ActiveTurn {
            session_id,
            owner_id,
            prompt,
            new_documents,
            stream,
            sessions,
            usage,
            stream_timeout,
            _slot,
        } = self;

        let abort_sink = sink.clone();
        let relayed = match tokio::time::timeout(stream_timeout, relay(stream, sink)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Turn for session {} discarded: {}", session_id, e);
                return TurnOutcome::Discarded { reason: e.to_string() };
            }
            Err(_) => {
                let reason = format!("stream exceeded {}s", stream_timeout.as_secs());
                let _ = abort_sink
                    .send(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, reason.clone())))
                    .await;
                warn!("Turn for session {} discarded: {}", session_id, reason);
                return TurnOutcome::Discarded { reason };
            }
        };
        drop(abort_sink);

        info!(
            stage = %TurnStage::PersistSession,
            "Streamed {} chars for session {}",
            relayed.full_text.len(),
            session_id
        );

        if let Some(info) = relayed.usage {
            record_usage(usage.as_ref(), &owner_id, UsageKind::Chat, info, Some(&session_id)).await;
        }

        let exchange = vec![Message::user(prompt), Message::assistant(relayed.full_text)];
        match sessions.append_exchange(&session_id, &owner_id, exchange, new_documents).await {
            Ok(session) => {
                debug!(stage = %TurnStage::Done, "Session {} now has {} messages", session.id, session.messages.len());
                TurnOutcome::Persisted { session, usage: relayed.usage }
            }
            Err(e) => {
                let failure = ChatError::PersistenceFailed(e.to_string());
                error!("Session {} not updated: {}", session_id, failure);
                TurnOutcome::PersistFailed { reason: failure.to_string() }
            }
        }
    }
}

struct StreamGauge;

impl StreamGauge {
    fn start() -> Self {
        metrics::inc_streams();
        StreamGauge
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        metrics::dec_streams();
    }
}

async fn record_usage(
    ledger: &dyn UsageLedger,
    owner_id: &str,
    kind: UsageKind,
    info: UsageInfo,
    session_id: Option<&str>,
) {
    metrics::add_tokens(kind.as_str(), info.total_tokens);
    if let Err(e) = ledger.record(UsageRecord::new(owner_id, kind, info, session_id)).await {
        warn!("Failed to record {} usage for {}: {}", kind.as_str(), owner_id, e);
    }
}

fn source_name_for(path: &str) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageContent, Role};
    use crate::providers::{JsonCompletion, OcrOutput, OcrPage, OcrProvider, OcrRequest, OcrUsage};
    use crate::session_store::{InMemorySessionStore, InMemoryUsageLedger};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    enum Script {
        Events(Vec<anyhow::Result<ProviderEvent>>),
        Refuse(&'static str),
    }

    #[derive(Default)]
    struct ScriptedModel {
        scripts: Mutex<VecDeque<Script>>,
        json_reply: Mutex<Option<String>>,
        calls: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn push(&self, script: Script) {
            self.scripts.lock().unwrap().push_back(script);
        }

        fn reply_with(&self, text: &str) {
            *self.json_reply.lock().unwrap() = Some(text.to_string());
        }

        fn last_call(&self) -> Vec<Message> {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn answer(text: &str) -> Script {
        Script::Events(vec![
            Ok(ProviderEvent::Delta(text.to_string())),
            Ok(ProviderEvent::UsageOnly(UsageInfo { prompt_tokens: 20, completion_tokens: 5, total_tokens: 25 })),
            Ok(ProviderEvent::Done),
        ])
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn stream_chat(&self, messages: Vec<Message>) -> anyhow::Result<ProviderStream> {
            self.calls.lock().unwrap().push(messages);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| answer("ok"));
            match script {
                Script::Events(events) => Ok(stream::iter(events).boxed()),
                Script::Refuse(reason) => anyhow::bail!(reason),
            }
        }

        async fn complete_json(&self, messages: Vec<Message>) -> anyhow::Result<JsonCompletion> {
            self.calls.lock().unwrap().push(messages);
            match self.json_reply.lock().unwrap().clone() {
                Some(json_text) => Ok(JsonCompletion {
                    json_text,
                    usage: Some(UsageInfo { prompt_tokens: 30, completion_tokens: 10, total_tokens: 40 }),
                }),
                None => anyhow::bail!("provider unavailable"),
            }
        }
    }

    /// Two pages per document. Names starting with `corrupt` fail, `blank`
    /// yields no pages and `slow` stalls for a second.
    struct FakeOcr;

    #[async_trait]
    impl OcrProvider for FakeOcr {
        async fn recognize(&self, request: OcrRequest<'_>) -> anyhow::Result<OcrOutput> {
            if request.source_name.starts_with("corrupt") {
                anyhow::bail!("corrupt file");
            }
            if request.source_name.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if request.source_name.starts_with("blank") {
                return Ok(OcrOutput { pages: Vec::new(), usage: OcrUsage { pages_processed: 0, doc_size_bytes: 0 } });
            }
            Ok(OcrOutput {
                pages: (0..2)
                    .map(|i| OcrPage {
                        index: i,
                        markdown: format!("{} page {}", request.source_name, i + 1),
                        images: Vec::new(),
                    })
                    .collect(),
                usage: OcrUsage { pages_processed: 2, doc_size_bytes: 0 },
            })
        }
    }

    struct FakeObjects;

    #[async_trait]
    impl ObjectStore for FakeObjects {
        async fn download(&self, owner_id: &str, path: &str, caller_token: &str) -> anyhow::Result<Vec<u8>> {
            assert_eq!(owner_id, "alice");
            assert_eq!(caller_token, "token");
            if path.contains("missing") {
                anyhow::bail!("404 Not Found");
            }
            Ok(path.as_bytes().to_vec())
        }
    }

    struct Harness {
        orchestrator: SessionOrchestrator,
        sessions: Arc<InMemorySessionStore>,
        ledger: Arc<InMemoryUsageLedger>,
        model: Arc<ScriptedModel>,
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig {
            system_prompt: "sys".to_string(),
            ..OrchestratorConfig::default()
        })
    }

    fn harness_with(config: OrchestratorConfig) -> Harness {
        let sessions = Arc::new(InMemorySessionStore::new());
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let model = Arc::new(ScriptedModel::default());
        let extractor = DocumentExtractor::new(Arc::new(FakeOcr), std::env::temp_dir(), Duration::from_secs(5));
        let orchestrator = SessionOrchestrator::new(
            sessions.clone(),
            ledger.clone(),
            model.clone(),
            Arc::new(FakeObjects),
            extractor,
            config,
        );
        Harness { orchestrator, sessions, ledger, model }
    }

    fn request(prompt: &str, session_id: Option<&str>, files: &[&str]) -> TurnRequest {
        TurnRequest {
            owner_id: "alice".to_string(),
            caller_token: "token".to_string(),
            prompt: prompt.to_string(),
            session_id: session_id.map(str::to_string),
            file_paths: files.iter().map(|f| f.to_string()).collect(),
            include_images: false,
        }
    }

    async fn run_turn(orchestrator: &SessionOrchestrator, request: TurnRequest) -> (String, TurnOutcome, String) {
        let turn = orchestrator.begin_turn(request).await.unwrap();
        let session_id = turn.session_id().to_string();
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
        let outcome = turn.run(tx).await;

        let mut body = String::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            body.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        (session_id, outcome, body)
    }

    fn seeded_session(sessions: &InMemorySessionStore) -> Session {
        let mut session = Session::new_empty("alice");
        session.id = "s1".to_string();
        session.messages = vec![Message::user("What is this?"), Message::assistant("A contract.")];
        sessions.insert(session.clone());
        session
    }

    #[tokio::test]
    async fn test_resumed_session_with_document() {
        let h = harness();
        let seeded = seeded_session(&h.sessions);
        h.model.push(answer("The contract states..."));

        let (session_id, outcome, body) =
            run_turn(&h.orchestrator, request("Summarize section 2", Some("s1"), &["uploads/contract.pdf"])).await;

        assert_eq!(session_id, "s1");
        assert_eq!(body, "The contract states...");

        let sent = h.model.last_call();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0], Message::system("sys"));
        assert_eq!(sent[1], seeded.messages[0]);
        assert_eq!(sent[2], seeded.messages[1]);
        assert_eq!(sent[3].role, Role::User);
        match &sent[3].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 4),
            other => panic!("expected document parts, got {other:?}"),
        }
        assert_eq!(sent[4], Message::user("Summarize section 2"));

        let TurnOutcome::Persisted { session, .. } = outcome else {
            panic!("turn was not persisted");
        };
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.documents.len(), 1);
        assert_eq!(session.documents[0].source_name, "contract.pdf");
        assert_eq!(session.messages[3], Message::assistant("The contract states..."));
    }

    #[tokio::test]
    async fn test_new_session_without_files() {
        let h = harness();
        h.model.push(answer("Hello!"));

        let (session_id, outcome, body) = run_turn(&h.orchestrator, request("Hi", None, &[])).await;
        assert_eq!(body, "Hello!");

        let stored = h.sessions.resolve(&session_id, "alice").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert!(stored.documents.is_empty());
        assert_eq!(stored.title.as_deref(), Some("Hi"));
        assert!(matches!(outcome, TurnOutcome::Persisted { usage: Some(_), .. }));

        let totals = h.ledger.totals_for_owner("alice").await.unwrap();
        assert_eq!(totals.chat_tokens, 25);
    }

    #[tokio::test]
    async fn test_history_grows_by_two_per_turn() {
        let h = harness();
        let (session_id, _, _) = run_turn(&h.orchestrator, request("one", None, &[])).await;
        for prompt in ["two", "three", "four"] {
            let (resumed, _, _) = run_turn(&h.orchestrator, request(prompt, Some(&session_id), &[])).await;
            assert_eq!(resumed, session_id);
        }

        let stored = h.sessions.resolve(&session_id, "alice").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 8);
        assert_eq!(h.sessions.list_for_owner("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_includes_previous_exchange() {
        let h = harness();
        h.model.push(answer("first answer"));
        let (session_id, _, _) = run_turn(&h.orchestrator, request("first question", None, &[])).await;
        let (resumed, _, _) = run_turn(&h.orchestrator, request("second question", Some(&session_id), &[])).await;

        assert_eq!(resumed, session_id);
        let sent = h.model.last_call();
        assert_eq!(sent[1], Message::user("first question"));
        assert_eq!(sent[2], Message::assistant("first answer"));
    }

    #[tokio::test]
    async fn test_one_failed_document_is_skipped() {
        let h = harness();
        let (_, outcome, body) = run_turn(
            &h.orchestrator,
            request("compare", None, &["a.pdf", "corrupt.pdf", "missing/c.pdf", "d.pdf"]),
        )
        .await;

        assert_eq!(body, "ok");
        let TurnOutcome::Persisted { session, .. } = outcome else {
            panic!("turn was not persisted");
        };
        let names: Vec<&str> = session.documents.iter().map(|d| d.source_name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "d.pdf"]);
    }

    #[tokio::test]
    async fn test_zero_page_document_is_recorded_but_not_sent() {
        let h = harness();
        let (_, outcome, _) = run_turn(&h.orchestrator, request("what is in it?", None, &["uploads/blank.pdf"])).await;

        let sent = h.model.last_call();
        assert_eq!(sent, vec![Message::system("sys"), Message::user("what is in it?")]);

        let TurnOutcome::Persisted { session, .. } = outcome else {
            panic!("turn was not persisted");
        };
        assert_eq!(session.documents.len(), 1);
        assert_eq!(session.documents[0].source_name, "blank.pdf");
        assert_eq!(session.documents[0].page_count, 0);
    }

    #[tokio::test]
    async fn test_truncated_provider_body_is_discarded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"The con\"}}]}\n\n")
            .create_async()
            .await;

        let sessions = Arc::new(InMemorySessionStore::new());
        let orchestrator = SessionOrchestrator::new(
            sessions.clone(),
            Arc::new(InMemoryUsageLedger::new()),
            Arc::new(crate::providers::LLMClient::new(server.url(), "test-model")),
            Arc::new(FakeObjects),
            DocumentExtractor::new(Arc::new(FakeOcr), std::env::temp_dir(), Duration::from_secs(5)),
            OrchestratorConfig::default(),
        );

        let (session_id, outcome, body) = run_turn(&orchestrator, request("summarize", None, &[])).await;
        assert_eq!(body, "The con");
        assert!(matches!(outcome, TurnOutcome::Discarded { ref reason } if reason.contains("before completion")));
        assert!(sessions.resolve(&session_id, "alice").await.unwrap().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_slow_preparation_times_out_with_session_id() {
        let h = harness_with(OrchestratorConfig {
            pre_stream_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        });

        let failure = h.orchestrator.begin_turn(request("hi", None, &["slow.pdf"])).await.unwrap_err();
        assert_eq!(failure.error.code(), "timed_out");
        let session_id = failure.session_id.expect("session id is reported");
        assert!(h.sessions.resolve(&session_id, "alice").await.unwrap().is_some());
        assert!(h.model.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_slot_is_held_until_turn_finishes() {
        let h = harness_with(OrchestratorConfig {
            pre_stream_timeout: Duration::from_millis(50),
            max_concurrent_streams: 1,
            ..OrchestratorConfig::default()
        });

        let first = h.orchestrator.begin_turn(request("one", None, &[])).await.unwrap();
        let blocked = h.orchestrator.begin_turn(request("two", None, &[])).await.unwrap_err();
        assert_eq!(blocked.error.code(), "timed_out");

        let (tx, _rx) = mpsc::channel(64);
        assert!(matches!(first.run(tx).await, TurnOutcome::Persisted { .. }));
        assert!(h.orchestrator.begin_turn(request("three", None, &[])).await.is_ok());
    }

    #[tokio::test]
    async fn test_mid_stream_error_persists_nothing() {
        let h = harness();
        let before = seeded_session(&h.sessions);
        h.model.push(Script::Events(vec![
            Ok(ProviderEvent::Delta("The contr".into())),
            Err(anyhow::anyhow!("connection reset")),
        ]));

        let (_, outcome, body) = run_turn(&h.orchestrator, request("go on", Some("s1"), &["extra.pdf"])).await;

        assert_eq!(body, "The contr");
        assert!(matches!(outcome, TurnOutcome::Discarded { .. }));
        let after = h.sessions.resolve("s1", "alice").await.unwrap().unwrap();
        assert_eq!(after.messages, before.messages);
        assert_eq!(after.documents, before.documents);
        assert_eq!(h.ledger.totals_for_owner("alice").await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_error_before_first_chunk_reports_session_id() {
        let h = harness();
        h.model.push(Script::Refuse("model overloaded"));

        let failure = h.orchestrator.begin_turn(request("hello", None, &[])).await.unwrap_err();
        assert_eq!(failure.error.code(), "model_call_failed");
        let session_id = failure.session_id.expect("session id is reported");
        assert!(h.sessions.resolve(&session_id, "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_provider_error_as_first_event_is_pre_stream() {
        let h = harness();
        h.model.push(Script::Events(vec![Ok(ProviderEvent::ProviderError("quota exceeded".into()))]));

        let failure = h.orchestrator.begin_turn(request("hello", Some("s1"), &[])).await.unwrap_err();
        assert!(matches!(failure.error, ChatError::ModelCallFailed(ref m) if m == "quota exceeded"));
    }

    #[tokio::test]
    async fn test_foreign_session_id_starts_new_session() {
        let h = harness();
        seeded_session(&h.sessions);

        let mut req = request("hi", Some("s1"), &[]);
        req.owner_id = "mallory".to_string();
        let (session_id, _, _) = run_turn(&h.orchestrator, req).await;

        assert_ne!(session_id, "s1");
        assert_eq!(h.sessions.resolve("s1", "alice").await.unwrap().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_before_any_call() {
        let h = harness();
        let failure = h.orchestrator.begin_turn(request("   ", None, &[])).await.unwrap_err();
        assert_eq!(failure.error.code(), "validation_failed");
        assert!(failure.session_id.is_none());
        assert!(h.model.calls.lock().unwrap().is_empty());
        assert!(h.sessions.list_for_owner("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_caller_discards_turn() {
        let h = harness();
        seeded_session(&h.sessions);
        let turn = h.orchestrator.begin_turn(request("hi", Some("s1"), &[])).await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        assert!(matches!(turn.run(tx).await, TurnOutcome::Discarded { .. }));
        assert_eq!(h.sessions.resolve("s1", "alice").await.unwrap().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_timeout_discards_turn() {
        let h = harness();
        let mut orchestrator = h.orchestrator;
        orchestrator.config.stream_timeout = Duration::from_millis(20);
        let slow: ProviderStream = stream::iter(vec![Ok(ProviderEvent::Delta("a".into()))])
            .chain(stream::pending())
            .boxed();

        let turn = ActiveTurn {
            session_id: "s1".into(),
            owner_id: "alice".into(),
            prompt: "hi".into(),
            new_documents: Vec::new(),
            stream: slow,
            sessions: h.sessions.clone(),
            usage: h.ledger.clone(),
            stream_timeout: orchestrator.config.stream_timeout,
            _slot: Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap(),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let outcome = turn.run(tx).await;

        assert!(matches!(outcome, TurnOutcome::Discarded { ref reason } if reason.contains("exceeded")));
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
    }

    struct BrokenStore(InMemorySessionStore);

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn resolve(&self, session_id: &str, owner_id: &str) -> anyhow::Result<Option<Session>> {
            self.0.resolve(session_id, owner_id).await
        }

        async fn create_empty(&self, owner_id: &str) -> anyhow::Result<Session> {
            self.0.create_empty(owner_id).await
        }

        async fn append_exchange(
            &self,
            _session_id: &str,
            _owner_id: &str,
            _new_messages: Vec<Message>,
            _new_documents: Vec<DocumentContext>,
        ) -> anyhow::Result<Session> {
            anyhow::bail!("disk full")
        }

        async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Session>> {
            self.0.list_for_owner(owner_id).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_still_delivers_answer() {
        let model = Arc::new(ScriptedModel::default());
        model.push(answer("delivered"));
        let orchestrator = SessionOrchestrator::new(
            Arc::new(BrokenStore(InMemorySessionStore::new())),
            Arc::new(InMemoryUsageLedger::new()),
            model,
            Arc::new(FakeObjects),
            DocumentExtractor::new(Arc::new(FakeOcr), std::env::temp_dir(), Duration::from_secs(5)),
            OrchestratorConfig::default(),
        );

        let (_, outcome, body) = run_turn(&orchestrator, request("hi", None, &[])).await;
        assert_eq!(body, "delivered");
        assert!(matches!(outcome, TurnOutcome::PersistFailed { ref reason } if reason.contains("disk full")));
    }

    #[tokio::test]
    async fn test_analyze_session_returns_findings() {
        let h = harness();
        run_turn(&h.orchestrator, request("read this", None, &["lease.pdf"])).await;
        let session_id = h.sessions.list_for_owner("alice").await.unwrap()[0].id.clone();
        h.model.reply_with(r#"[{"level":"warning","description":"Late fee is high","location_hint":"page 2"}]"#);

        let report = h
            .orchestrator
            .analyze_session("alice", &session_id, Some("Focus on fees"))
            .await
            .unwrap();

        assert_eq!(report.session_id, session_id);
        assert_eq!(report.findings.len(), 1);
        let sent = h.model.last_call();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].content.as_text(), h.orchestrator.config.analysis_prompt);
        assert!(sent[2].content.as_text().ends_with("Focus on fees"));
        assert_eq!(h.ledger.totals_for_owner("alice").await.unwrap().analysis_tokens, 40);
    }

    #[tokio::test]
    async fn test_analyze_rejects_bad_output_and_unknown_sessions() {
        let h = harness();
        run_turn(&h.orchestrator, request("read this", None, &["lease.pdf"])).await;
        let session_id = h.sessions.list_for_owner("alice").await.unwrap()[0].id.clone();

        h.model.reply_with(r#"{"level":"info"}"#);
        let err = h.orchestrator.analyze_session("alice", &session_id, None).await.unwrap_err();
        assert_eq!(err.code(), "analysis_parse_failed");

        let err = h.orchestrator.analyze_session("mallory", &session_id, None).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_analyze_requires_documents() {
        let h = harness();
        seeded_session(&h.sessions);
        let err = h.orchestrator.analyze_session("alice", "s1", None).await.unwrap_err();
        assert_eq!(err.code(), "validation_failed");
    }

    #[test]
    fn test_source_name_for_paths() {
        assert_eq!(source_name_for("user/42/contract.pdf"), "contract.pdf");
        assert_eq!(source_name_for("scan.png"), "scan.png");
    }
}
