//! Process-wide session registry.
//!
//! One `VoiceSession` per active voice interaction. The registry map is the
//! only state shared across sessions; everything inside a session is guarded
//! by its own locks so concurrent callbacks on one session (upstream events,
//! forwarded audio, teardown) serialize without blocking other sessions.

use dashmap::DashMap;
use gemini_live::{LiveEvent, LiveHandle};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::{sync::mpsc, task::JoinHandle};

pub const DEFAULT_INPUT_MIME: &str = "audio/pcm;rate=44100";
pub const DEFAULT_OUTPUT_MIME: &str = "audio/pcm;rate=24000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Creating,
    /// Connected and idle between turns.
    Ready,
    Streaming,
    Closing,
    Closed,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Errored)
    }

    pub fn accepts_audio(self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Streaming)
    }
}

/// State for a single voice interaction. Created by [`SessionRegistry`],
/// shared across transport handlers and background tasks via `Arc`.
#[derive(Debug)]
pub struct VoiceSession {
    pub id: String,
    status: Mutex<SessionStatus>,
    upstream: tokio::sync::Mutex<Option<LiveHandle>>,
    pending: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<LiveEvent>>>,
    fragments: Mutex<Vec<String>>,
    client_conn: Mutex<Option<u64>>,
    input_mime: Mutex<String>,
    pub output_mime: String,
    last_activity: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceSession {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            status: Mutex::new(SessionStatus::Creating),
            upstream: tokio::sync::Mutex::new(None),
            pending: tokio::sync::Mutex::new(None),
            fragments: Mutex::new(Vec::new()),
            client_conn: Mutex::new(None),
            input_mime: Mutex::new(DEFAULT_INPUT_MIME.to_string()),
            output_mime: DEFAULT_OUTPUT_MIME.to_string(),
            last_activity: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, to: SessionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    /// Compare-and-set status transition; returns whether it happened. Keeps
    /// a session from being, say, both closing and receiving audio at once.
    pub fn transition(&self, from: &[SessionStatus], to: SessionStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if from.contains(&*status) {
            *status = to;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn set_client_conn(&self, conn: Option<u64>) {
        *self
            .client_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = conn;
    }

    /// Whether this session still belongs to the given transport connection.
    /// Guards against cross-session delivery after a reconnect reuses an id.
    pub fn owned_by(&self, conn: u64) -> bool {
        *self
            .client_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(conn)
    }

    pub fn input_mime(&self) -> String {
        self.input_mime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_input_mime(&self, mime: String) {
        *self
            .input_mime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mime;
    }

    pub fn push_fragment(&self, data: String) {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
    }

    pub fn take_fragments(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .fragments
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn has_fragments(&self) -> bool {
        !self
            .fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Installs the upstream handle and its event stream, returning any
    /// handle that was displaced. The caller must close the displaced handle;
    /// a session never references two live upstream connections.
    pub async fn install_upstream(
        &self,
        handle: LiveHandle,
        events: mpsc::UnboundedReceiver<LiveEvent>,
    ) -> Option<LiveHandle> {
        let displaced = self.upstream.lock().await.replace(handle);
        *self.pending.lock().await = Some(events);
        displaced
    }

    pub async fn take_upstream(&self) -> Option<LiveHandle> {
        self.upstream.lock().await.take()
    }

    /// Forwards base64 audio to the upstream handle, if one is installed.
    pub async fn upstream_send_audio(
        &self,
        data: String,
        mime: &str,
    ) -> Result<(), gemini_live::LiveError> {
        match self.upstream.lock().await.as_ref() {
            Some(handle) => handle.send_audio(data, mime).await,
            None => Err(gemini_live::LiveError::Disconnected),
        }
    }

    /// Answers tool calls on the upstream handle, if one is installed.
    pub async fn upstream_send_tool_responses(
        &self,
        responses: Vec<gemini_live::FunctionResponse>,
    ) -> Result<(), gemini_live::LiveError> {
        match self.upstream.lock().await.as_ref() {
            Some(handle) => handle.send_tool_responses(responses).await,
            None => Err(gemini_live::LiveError::Disconnected),
        }
    }

    pub(crate) async fn lock_pending(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<LiveEvent>>> {
        self.pending.lock().await
    }

    /// Registers a background task (delivery loop, idle watchdog) whose
    /// lifetime is bounded by this session.
    pub fn adopt_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn abort_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

/// Map from session id to live session state. Cheap to clone; constructed
/// once at startup and injected wherever sessions are looked up.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<VoiceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh session in `Creating` state. Any existing entry under
    /// the same id is replaced; callers supersede (close the old upstream)
    /// before creating, see the orchestrator's `start`.
    pub fn create(&self, id: &str) -> Arc<VoiceSession> {
        let session = VoiceSession::new(id);
        self.sessions.insert(id.to_string(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
