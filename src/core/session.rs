//! The session orchestrator.
//!
//! One `ChatSession` owns one conversation lifetime: the turn log, the
//! phase machine, backend readiness, the local engine handle, and any
//! in-flight provisioning task. All mutation funnels through `&mut self`
//! methods, so token appends, finalization, and placeholder replacement are
//! serialized by ownership rather than by a lock.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::anthropic::AnthropicSse;
use crate::adapters::gemini::GeminiChat;
use crate::adapters::local::LocalStream;
use crate::adapters::openai::OpenAiSse;
use crate::adapters::{
    AdapterError, AdapterErrorKind, StreamParams, StreamingAdapter, TokenEvent,
};
use crate::core::backends::{BackendDescriptor, BackendState, WireDialect};
use crate::core::config::Config;
use crate::core::conversation::{ConversationLog, Origin, Turn};
use crate::core::mode::{select_mode, ConnectivityProbe, InferenceMode, TcpDialProbe};
use crate::core::setup::{self, SetupRequest};
use crate::local::{LocalEngine, LocalEngineLoader, UnavailableEngineLoader};
use crate::provision::{
    file_name_from_url, HttpModelProvisioner, ModelProvisioner, ProvisionErrorKind,
    ProvisionProgress,
};

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Provisioning,
    Initializing,
    Ready,
    Failed,
}

/// Dismissible notification raised when an online failure demoted the
/// conversation to local inference.
#[derive(Debug, Clone)]
pub struct FallbackNotice {
    pub backend: String,
    pub message: String,
}

/// Everything `initialize` needs. Kept on the session so provisioning can
/// re-initialize with the freshly downloaded model path.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub backend_id: Option<String>,
    pub credential: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub model_path: Option<PathBuf>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Completed(InferenceMode),
    Failed { message: String },
    Cancelled,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotReady,
    Busy,
    NoBackendAvailable,
}

enum StreamEnd {
    Complete,
    Cancelled,
    Failed(AdapterError),
}

enum ProvisionEvent {
    Progress(ProvisionProgress),
    Complete(PathBuf),
    Failed(String),
}

struct ProvisioningTask {
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<ProvisionEvent>,
}

#[derive(Default)]
pub struct SessionBuilder {
    client: Option<reqwest::Client>,
    connectivity: Option<Arc<dyn ConnectivityProbe>>,
    provisioner: Option<Arc<dyn ModelProvisioner>>,
    loader: Option<Arc<dyn LocalEngineLoader>>,
    model_dir: Option<PathBuf>,
}

impl SessionBuilder {
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn ModelProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn engine_loader(mut self, loader: Arc<dyn LocalEngineLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn model_dir(mut self, dir: PathBuf) -> Self {
        self.model_dir = Some(dir);
        self
    }

    pub fn build(self) -> ChatSession {
        let client = self.client.unwrap_or_default();
        ChatSession {
            provisioner: self
                .provisioner
                .unwrap_or_else(|| Arc::new(HttpModelProvisioner::new(client.clone()))),
            connectivity: self
                .connectivity
                .unwrap_or_else(|| Arc::new(TcpDialProbe::default())),
            loader: self.loader.unwrap_or_else(|| Arc::new(UnavailableEngineLoader)),
            model_dir: self.model_dir.unwrap_or_else(Config::default_model_dir),
            client,
            log: ConversationLog::new(),
            phase: SessionPhase::Uninitialized,
            active_mode: None,
            generating: false,
            backend: None,
            online: BackendState::default(),
            local: BackendState::default(),
            engine: None,
            options: SessionOptions::default(),
            status: None,
            notices: Vec::new(),
            provisioning: None,
            provision_progress: None,
        }
    }
}

pub struct ChatSession {
    client: reqwest::Client,
    log: ConversationLog,
    phase: SessionPhase,
    active_mode: Option<InferenceMode>,
    generating: bool,
    backend: Option<BackendDescriptor>,
    online: BackendState,
    local: BackendState,
    engine: Option<Arc<dyn LocalEngine>>,
    options: SessionOptions,
    status: Option<String>,
    notices: Vec<FallbackNotice>,
    provisioning: Option<ProvisioningTask>,
    provision_progress: Option<ProvisionProgress>,
    connectivity: Arc<dyn ConnectivityProbe>,
    provisioner: Arc<dyn ModelProvisioner>,
    loader: Arc<dyn LocalEngineLoader>,
    model_dir: PathBuf,
}

impl ChatSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn generating(&self) -> bool {
        self.generating
    }

    pub fn active_mode(&self) -> Option<InferenceMode> {
        self.active_mode
    }

    /// Human-readable summary of the last setup or provisioning outcome.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn conversation(&self) -> &ConversationLog {
        &self.log
    }

    pub fn clear_conversation(&mut self) {
        self.log.clear();
    }

    pub fn online_state(&self) -> &BackendState {
        &self.online
    }

    pub fn local_state(&self) -> &BackendState {
        &self.local
    }

    pub fn provision_progress(&self) -> Option<ProvisionProgress> {
        self.provision_progress
    }

    /// Drain queued fallback notifications.
    pub fn take_notices(&mut self) -> Vec<FallbackNotice> {
        std::mem::take(&mut self.notices)
    }

    /// (Re-)initialize both sides from the given options. The previous
    /// engine is released before anything else so a failed re-setup cannot
    /// leak it. Ignored while provisioning is in flight.
    pub fn initialize(&mut self, options: SessionOptions) -> SessionPhase {
        if self.phase == SessionPhase::Provisioning {
            tracing::warn!("initialize ignored while a model download is in flight");
            return self.phase;
        }

        self.phase = SessionPhase::Initializing;
        if let Some(engine) = self.engine.take() {
            engine.release();
        }
        self.backend = None;
        self.online = BackendState::default();
        self.local = BackendState::default();

        let request = SetupRequest {
            backend_id: options.backend_id.as_deref(),
            base_url_override: options.base_url.as_deref(),
            credential: &options.credential,
            model_path: options.model_path.as_deref(),
            max_output_tokens: options
                .max_output_tokens
                .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
        };
        let outcome = setup::initialize(self.loader.as_ref(), &request);

        self.backend = outcome.backend;
        self.online = outcome.online;
        self.local = outcome.local;
        self.engine = outcome.engine;
        self.status = Some(outcome.summary);
        self.phase = if outcome.ready {
            SessionPhase::Ready
        } else {
            SessionPhase::Failed
        };
        self.options = options;
        self.phase
    }

    /// Tear everything down: conversation, readiness, engine, notices, and
    /// any provisioning task. Valid from any phase.
    pub fn reset(&mut self) {
        if let Some(task) = self.provisioning.take() {
            task.cancel.cancel();
        }
        if let Some(engine) = self.engine.take() {
            engine.release();
        }
        self.log.clear();
        self.notices.clear();
        self.backend = None;
        self.online = BackendState::default();
        self.local = BackendState::default();
        self.options = SessionOptions::default();
        self.status = None;
        self.active_mode = None;
        self.generating = false;
        self.provision_progress = None;
        self.phase = SessionPhase::Uninitialized;
    }

    /// Start acquiring the local model in the background. Only valid from
    /// `Uninitialized` or `Failed`; completion auto-initializes with
    /// `options` plus the freshly downloaded model path.
    pub fn provision_model(&mut self, url: &str, options: SessionOptions) -> bool {
        match self.phase {
            SessionPhase::Uninitialized | SessionPhase::Failed => {}
            _ => {
                tracing::warn!("provision_model ignored in phase {:?}", self.phase);
                return false;
            }
        }
        self.options = options;

        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let provisioner = self.provisioner.clone();
        let dest = self.model_dir.join(file_name_from_url(url));
        let url = url.to_string();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let download = provisioner.download(&url, &dest, progress_tx, task_cancel);
            tokio::pin!(download);
            loop {
                tokio::select! {
                    Some(progress) = progress_rx.recv() => {
                        let _ = events_tx.send(ProvisionEvent::Progress(progress));
                    }
                    result = &mut download => {
                        // Flush progress that raced with completion so
                        // events stay ordered.
                        while let Ok(progress) = progress_rx.try_recv() {
                            let _ = events_tx.send(ProvisionEvent::Progress(progress));
                        }
                        match result {
                            Ok(path) => {
                                let _ = events_tx.send(ProvisionEvent::Complete(path));
                            }
                            Err(e) if e.kind == ProvisionErrorKind::Cancelled => {}
                            Err(e) => {
                                let _ = events_tx.send(ProvisionEvent::Failed(e.to_string()));
                            }
                        }
                        break;
                    }
                }
            }
        });

        self.provisioning = Some(ProvisioningTask {
            cancel,
            events: events_rx,
        });
        self.provision_progress = Some(ProvisionProgress {
            bytes_downloaded: 0,
            total_bytes: None,
        });
        self.phase = SessionPhase::Provisioning;
        true
    }

    /// Token that cancels the in-flight download from another task.
    pub fn provisioning_cancel_handle(&self) -> Option<CancellationToken> {
        self.provisioning.as_ref().map(|task| task.cancel.clone())
    }

    /// Abort the download and return to `Uninitialized`. Partial output is
    /// deleted by the provisioner; no user-visible error is raised.
    pub fn cancel_provisioning(&mut self) {
        if let Some(task) = self.provisioning.take() {
            task.cancel.cancel();
        }
        if self.phase == SessionPhase::Provisioning {
            self.phase = SessionPhase::Uninitialized;
        }
        self.provision_progress = None;
    }

    /// Drain pending provisioning events without blocking. Suits callers
    /// with their own event loop.
    pub fn poll_provisioning(&mut self) -> SessionPhase {
        let Some(task) = self.provisioning.as_mut() else {
            return self.phase;
        };
        if task.cancel.is_cancelled() {
            self.provisioning = None;
            if self.phase == SessionPhase::Provisioning {
                self.phase = SessionPhase::Uninitialized;
            }
            self.provision_progress = None;
            return self.phase;
        }

        let mut latest = None;
        let mut terminal = None;
        loop {
            match task.events.try_recv() {
                Ok(ProvisionEvent::Progress(progress)) => latest = Some(progress),
                Ok(event) => {
                    terminal = Some(event);
                    break;
                }
                Err(_) => break,
            }
        }

        if let Some(progress) = latest {
            self.provision_progress = Some(progress);
        }
        match terminal {
            Some(ProvisionEvent::Complete(path)) => {
                self.provisioning = None;
                self.complete_provisioning(path);
            }
            Some(ProvisionEvent::Failed(message)) => {
                self.provisioning = None;
                self.fail_provisioning(message);
            }
            _ => {}
        }
        self.phase
    }

    /// Block until the download finishes, fails, or is cancelled (via
    /// [`Self::provisioning_cancel_handle`]), reporting progress along the
    /// way.
    pub async fn wait_for_provisioning(
        &mut self,
        mut on_progress: impl FnMut(ProvisionProgress),
    ) -> SessionPhase {
        let Some(mut task) = self.provisioning.take() else {
            return self.phase;
        };

        loop {
            tokio::select! {
                _ = task.cancel.cancelled() => {
                    self.phase = SessionPhase::Uninitialized;
                    self.provision_progress = None;
                    break;
                }
                event = task.events.recv() => match event {
                    Some(ProvisionEvent::Progress(progress)) => {
                        self.provision_progress = Some(progress);
                        on_progress(progress);
                    }
                    Some(ProvisionEvent::Complete(path)) => {
                        self.complete_provisioning(path);
                        break;
                    }
                    Some(ProvisionEvent::Failed(message)) => {
                        self.fail_provisioning(message);
                        break;
                    }
                    None => {
                        self.phase = SessionPhase::Uninitialized;
                        self.provision_progress = None;
                        break;
                    }
                }
            }
        }
        self.phase
    }

    fn complete_provisioning(&mut self, path: PathBuf) {
        self.provision_progress = None;
        let mut options = std::mem::take(&mut self.options);
        options.model_path = Some(path);
        self.phase = SessionPhase::Initializing;
        self.initialize(options);
    }

    fn fail_provisioning(&mut self, message: String) {
        self.provision_progress = None;
        self.status = Some(format!("Model download failed: {message}"));
        self.phase = SessionPhase::Failed;
    }

    pub async fn send(&mut self, text: &str) -> SendOutcome {
        self.send_with(text, CancellationToken::new(), |_| {}).await
    }

    /// Drive one exchange end to end: select a mode, append the user turn
    /// and a streaming placeholder, stream tokens into it, and on an online
    /// failure with a ready local engine retry exactly once locally.
    /// `generating` is cleared on every path out of here.
    pub async fn send_with(
        &mut self,
        text: &str,
        cancel: CancellationToken,
        mut on_token: impl FnMut(&str),
    ) -> SendOutcome {
        if self.phase != SessionPhase::Ready {
            return SendOutcome::Rejected(RejectReason::NotReady);
        }
        if self.generating {
            tracing::debug!("send ignored: a response is already streaming");
            return SendOutcome::Rejected(RejectReason::Busy);
        }

        let connectivity_up = self.connectivity.is_usable().await;
        let Some(mode) = select_mode(connectivity_up, self.online.ready, self.local.ready) else {
            return SendOutcome::Rejected(RejectReason::NoBackendAvailable);
        };

        let id = self.log.allocate_id();
        self.log.push(Turn::user(id, text));
        let id = self.log.allocate_id();
        self.log.push(Turn::placeholder(id, origin_of(mode)));
        self.generating = true;
        self.active_mode = Some(mode);

        let outcome = match self.run_stream(mode, text, cancel.clone(), &mut on_token).await {
            StreamEnd::Complete => {
                self.log.finalize_streaming();
                SendOutcome::Completed(mode)
            }
            StreamEnd::Cancelled => {
                self.log.finalize_streaming();
                SendOutcome::Cancelled
            }
            StreamEnd::Failed(err) if mode == InferenceMode::Online && self.local.ready => {
                self.demote_to_local(&err);
                match self
                    .run_stream(InferenceMode::Local, text, cancel, &mut on_token)
                    .await
                {
                    StreamEnd::Complete => {
                        self.log.finalize_streaming();
                        SendOutcome::Completed(InferenceMode::Local)
                    }
                    StreamEnd::Cancelled => {
                        self.log.finalize_streaming();
                        SendOutcome::Cancelled
                    }
                    StreamEnd::Failed(retry_err) => {
                        self.log.fail_last(retry_err.message.clone());
                        SendOutcome::Failed {
                            message: retry_err.message,
                        }
                    }
                }
            }
            StreamEnd::Failed(err) => {
                self.log.fail_last(err.message.clone());
                SendOutcome::Failed {
                    message: err.message,
                }
            }
        };

        self.generating = false;
        outcome
    }

    /// Mark the online side failed, queue the notification, and swap the
    /// placeholder for a fresh local one. The partial online output is
    /// discarded with it.
    fn demote_to_local(&mut self, err: &AdapterError) {
        let backend_name = self
            .backend
            .as_ref()
            .map(|b| b.display_name.clone())
            .unwrap_or_else(|| "online backend".to_string());
        tracing::warn!(
            "online send via {backend_name} failed ({}); retrying locally",
            err.message
        );
        self.online.ready = false;
        self.online.last_error = Some(err.message.clone());
        self.notices.push(FallbackNotice {
            backend: backend_name,
            message: err.message.clone(),
        });
        self.active_mode = Some(InferenceMode::Local);
        let id = self.log.allocate_id();
        self.log.replace_last(Turn::placeholder(id, Origin::Local));
    }

    async fn run_stream(
        &mut self,
        mode: InferenceMode,
        new_message: &str,
        cancel: CancellationToken,
        on_token: &mut impl FnMut(&str),
    ) -> StreamEnd {
        let history = self.log.history_for_send();
        let max_output_tokens = self
            .options
            .max_output_tokens
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);

        let mut rx = match mode {
            InferenceMode::Online => {
                let Some(backend) = self.backend.as_ref() else {
                    return StreamEnd::Failed(AdapterError::configuration(
                        "no online backend selected",
                    ));
                };
                let params = StreamParams {
                    client: self.client.clone(),
                    base_url: backend.base_url.clone(),
                    credential: self.options.credential.clone(),
                    model: self
                        .options
                        .model
                        .clone()
                        .unwrap_or_else(|| backend.default_model.clone()),
                    history,
                    new_message: new_message.to_string(),
                    max_output_tokens,
                    cancel: cancel.clone(),
                };
                match backend.dialect {
                    WireDialect::Gemini => GeminiChat.stream(params),
                    WireDialect::OpenAi => OpenAiSse.stream(params),
                    WireDialect::Anthropic => AnthropicSse.stream(params),
                }
            }
            InferenceMode::Local => {
                let Some(engine) = self.engine.clone() else {
                    return StreamEnd::Failed(AdapterError::configuration(
                        "local engine not initialized",
                    ));
                };
                let params = StreamParams {
                    client: self.client.clone(),
                    base_url: String::new(),
                    credential: String::new(),
                    model: String::new(),
                    history,
                    new_message: new_message.to_string(),
                    max_output_tokens,
                    cancel: cancel.clone(),
                };
                LocalStream { engine }.stream(params)
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                event = rx.recv() => match event {
                    Some(TokenEvent::Chunk(token)) => {
                        self.log.append_token(&token);
                        on_token(&token);
                    }
                    Some(TokenEvent::End) => return StreamEnd::Complete,
                    Some(TokenEvent::Failed(err)) if err.kind == AdapterErrorKind::Cancelled => {
                        return StreamEnd::Cancelled;
                    }
                    Some(TokenEvent::Failed(err)) => return StreamEnd::Failed(err),
                    None => {
                        return if cancel.is_cancelled() {
                            StreamEnd::Cancelled
                        } else {
                            StreamEnd::Failed(AdapterError::transport(
                                "token stream closed before completion",
                            ))
                        };
                    }
                }
            }
        }
    }
}

fn origin_of(mode: InferenceMode) -> Origin {
    match mode {
        InferenceMode::Online => Origin::Online,
        InferenceMode::Local => Origin::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::Speaker;
    use crate::local::{EngineConfig, LocalEngineError, TokenCallback};
    use crate::provision::ProvisionError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct FixedProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn is_usable(&self) -> bool {
            self.0
        }
    }

    struct ScriptedEngine {
        chunks: Vec<&'static str>,
        delay: Option<Duration>,
        fail: bool,
        released: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                delay: None,
                fail: false,
                released: AtomicUsize::new(0),
            }
        }
    }

    impl LocalEngine for ScriptedEngine {
        fn generate(
            &self,
            _prompt: &str,
            mut on_token: TokenCallback,
        ) -> Result<(), LocalEngineError> {
            if self.fail {
                return Err(LocalEngineError::new("local model crashed"));
            }
            for chunk in &self.chunks {
                if let Some(delay) = self.delay {
                    std::thread::sleep(delay);
                }
                on_token(chunk, false);
            }
            on_token("", true);
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StaticLoader {
        engine: Arc<ScriptedEngine>,
    }

    impl LocalEngineLoader for StaticLoader {
        fn load(
            &self,
            _model_path: &Path,
            _config: &EngineConfig,
        ) -> Result<Arc<dyn LocalEngine>, LocalEngineError> {
            Ok(self.engine.clone())
        }
    }

    struct CompletingProvisioner;

    #[async_trait]
    impl ModelProvisioner for CompletingProvisioner {
        async fn download(
            &self,
            _url: &str,
            dest: &Path,
            progress: mpsc::UnboundedSender<ProvisionProgress>,
            _cancel: CancellationToken,
        ) -> Result<PathBuf, ProvisionError> {
            for step in 1..=3u64 {
                let _ = progress.send(ProvisionProgress {
                    bytes_downloaded: step * 100,
                    total_bytes: Some(300),
                });
            }
            Ok(dest.to_path_buf())
        }
    }

    struct EndlessProvisioner;

    #[async_trait]
    impl ModelProvisioner for EndlessProvisioner {
        async fn download(
            &self,
            _url: &str,
            dest: &Path,
            progress: mpsc::UnboundedSender<ProvisionProgress>,
            cancel: CancellationToken,
        ) -> Result<PathBuf, ProvisionError> {
            let part = crate::provision::partial_path(dest);
            tokio::fs::write(&part, b"partial")
                .await
                .map_err(|e| ProvisionError::io(e.to_string()))?;
            let mut downloaded = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tokio::fs::remove_file(&part).await;
                        return Err(ProvisionError::cancelled());
                    }
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        downloaded += 1;
                        let _ = progress.send(ProvisionProgress {
                            bytes_downloaded: downloaded,
                            total_bytes: None,
                        });
                    }
                }
            }
        }
    }

    fn session_with(
        engine: Arc<ScriptedEngine>,
        connected: bool,
        provisioner: Arc<dyn ModelProvisioner>,
        model_dir: PathBuf,
    ) -> ChatSession {
        ChatSession::builder()
            .connectivity(Arc::new(FixedProbe(connected)))
            .engine_loader(Arc::new(StaticLoader { engine }))
            .provisioner(provisioner)
            .model_dir(model_dir)
            .build()
    }

    fn local_only_options() -> SessionOptions {
        SessionOptions {
            model_path: Some(PathBuf::from("/models/test.task")),
            ..SessionOptions::default()
        }
    }

    fn dual_options() -> SessionOptions {
        SessionOptions {
            backend_id: Some("openai".to_string()),
            credential: "sk-test".to_string(),
            // Nothing listens here; the online attempt fails fast with a
            // connection error.
            base_url: Some("http://127.0.0.1:9".to_string()),
            model_path: Some(PathBuf::from("/models/test.task")),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn local_send_streams_into_one_turn() {
        let engine = Arc::new(ScriptedEngine::new(vec!["local ", "answer"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );

        assert_eq!(session.initialize(local_only_options()), SessionPhase::Ready);

        let mut seen = String::new();
        let outcome = session
            .send_with("hi there", CancellationToken::new(), |t| seen.push_str(t))
            .await;

        assert_eq!(outcome, SendOutcome::Completed(InferenceMode::Local));
        assert_eq!(seen, "local answer");
        assert!(!session.generating());
        assert_eq!(session.active_mode(), Some(InferenceMode::Local));

        let turns = session.conversation().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::User);
        assert_eq!(turns[1].content, "local answer");
        assert_eq!(turns[1].origin, Origin::Local);
        assert_eq!(session.conversation().streaming_count(), 0);
    }

    #[tokio::test]
    async fn online_failure_falls_back_to_local_once() {
        let engine = Arc::new(ScriptedEngine::new(vec!["offline reply"]));
        let mut session = session_with(
            engine,
            true,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );

        assert_eq!(session.initialize(dual_options()), SessionPhase::Ready);
        assert!(session.online_state().ready);

        let outcome = session.send("does this work?").await;

        assert_eq!(outcome, SendOutcome::Completed(InferenceMode::Local));

        // Exactly one assistant turn survives, sourced from the local engine.
        let assistants: Vec<_> = session
            .conversation()
            .turns()
            .iter()
            .filter(|t| t.is_assistant())
            .collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].origin, Origin::Local);
        assert_eq!(assistants[0].content, "offline reply");
        assert!(assistants[0].error.is_none());

        // The online side is demoted and the notice names it.
        assert!(!session.online_state().ready);
        let notices = session.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].backend, "OpenAI");
        assert!(session.take_notices().is_empty());
        assert!(!session.generating());
    }

    #[tokio::test]
    async fn local_failure_does_not_fall_back_to_online() {
        let engine = Arc::new(ScriptedEngine {
            chunks: Vec::new(),
            delay: None,
            fail: true,
            released: AtomicUsize::new(0),
        });
        // Oracle says offline, so the selector picks local even though the
        // online side is configured.
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );
        session.initialize(dual_options());

        let outcome = session.send("hello?").await;

        match outcome {
            SendOutcome::Failed { message } => assert!(message.contains("local model crashed")),
            other => panic!("expected failure, got {other:?}"),
        }
        // No reverse fallback: the online side keeps its readiness.
        assert!(session.online_state().ready);
        assert!(session.take_notices().is_empty());

        let last = session.conversation().last_assistant().unwrap();
        assert!(last.error.as_deref().unwrap().contains("local model crashed"));
        assert!(!last.streaming);
        assert!(!session.generating());
    }

    #[tokio::test]
    async fn send_while_generating_is_a_noop() {
        let engine = Arc::new(ScriptedEngine::new(vec!["x"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );
        session.initialize(local_only_options());
        session.generating = true;

        let outcome = session.send("second message").await;

        assert_eq!(outcome, SendOutcome::Rejected(RejectReason::Busy));
        assert!(session.conversation().is_empty());
        assert!(session.generating);
    }

    #[tokio::test]
    async fn send_is_rejected_before_initialization() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut session = session_with(
            engine,
            true,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );

        let outcome = session.send("too early").await;
        assert_eq!(outcome, SendOutcome::Rejected(RejectReason::NotReady));
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn send_with_no_ready_backend_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new(vec!["x"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );
        session.initialize(local_only_options());
        // Simulate the local side dying after setup.
        session.local.ready = false;

        let outcome = session.send("anyone?").await;
        assert_eq!(
            outcome,
            SendOutcome::Rejected(RejectReason::NoBackendAvailable)
        );
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn cancellation_finalizes_silently() {
        let engine = Arc::new(ScriptedEngine {
            chunks: vec!["one", "two", "three"],
            delay: Some(Duration::from_millis(50)),
            fail: false,
            released: AtomicUsize::new(0),
        });
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );
        session.initialize(local_only_options());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = session
            .send_with("long answer please", cancel, move |_| trigger.cancel())
            .await;

        assert_eq!(outcome, SendOutcome::Cancelled);
        assert!(!session.generating());
        assert_eq!(session.conversation().streaming_count(), 0);

        let last = session.conversation().last_assistant().unwrap();
        assert!(last.error.is_none());
        assert_eq!(last.content, "one");
    }

    #[tokio::test]
    async fn reinitialize_releases_the_previous_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec!["x"]));
        let mut session = session_with(
            engine.clone(),
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );

        session.initialize(local_only_options());
        assert_eq!(engine.released.load(Ordering::SeqCst), 0);

        session.initialize(local_only_options());
        assert_eq!(engine.released.load(Ordering::SeqCst), 1);

        session.reset();
        assert_eq!(engine.released.load(Ordering::SeqCst), 2);
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn provisioning_completion_auto_initializes() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(vec!["ready"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            dir.path().to_path_buf(),
        );

        assert!(session.provision_model("https://example.com/gemma.task", SessionOptions::default()));
        assert_eq!(session.phase(), SessionPhase::Provisioning);

        let mut fractions = Vec::new();
        let phase = session
            .wait_for_provisioning(|p| fractions.push(p.fraction()))
            .await;

        assert_eq!(phase, SessionPhase::Ready);
        assert_eq!(fractions.last(), Some(&Some(1.0)));
        assert!(session.local_state().ready);
        let expected = dir.path().join("gemma.task");
        assert_eq!(session.options.model_path.as_deref(), Some(expected.as_path()));
        assert!(session.provision_progress().is_none());
    }

    #[tokio::test]
    async fn provisioning_cancel_returns_to_uninitialized_without_partials() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::new(vec!["x"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(EndlessProvisioner),
            dir.path().to_path_buf(),
        );

        assert!(session.provision_model("https://example.com/gemma.task", SessionOptions::default()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.poll_provisioning();
        assert_eq!(session.phase(), SessionPhase::Provisioning);
        assert!(session.provision_progress().is_some());

        session.cancel_provisioning();
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert!(session.provision_progress().is_none());

        // Give the download task a moment to delete its partial file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "partial files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn provisioning_is_rejected_while_ready() {
        let engine = Arc::new(ScriptedEngine::new(vec!["x"]));
        let mut session = session_with(
            engine,
            false,
            Arc::new(CompletingProvisioner),
            std::env::temp_dir(),
        );
        session.initialize(local_only_options());
        assert_eq!(session.phase(), SessionPhase::Ready);

        assert!(!session.provision_model("https://example.com/gemma.task", SessionOptions::default()));
        assert_eq!(session.phase(), SessionPhase::Ready);
    }
}
