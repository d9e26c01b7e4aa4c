//! In-memory fakes for the collaborator traits and the agent server.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use paddock_agent_client::{
    AgentApi, AgentServerError, EventEnvelope, EventSubscription, SessionInfo,
};
use paddock_protocol::{
    MessageRecord, ProjectRecord, PromptPart, SessionChanges, SessionNotification, SessionRecord,
    WorktreeFields, WorktreeRecord,
};

use crate::lifecycle::{LaunchedServer, ServerLauncher};
use crate::traits::{Desktop, Storage, WorktreeGit};

/// Poll `condition` until it holds; panics after two seconds.
pub(crate) async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeGit {
    state: StdMutex<GitState>,
}

#[derive(Default)]
struct GitState {
    branches: HashSet<String>,
    worktrees: HashMap<String, WorktreeRecord>,
    fail_renames: bool,
}

impl FakeGit {
    /// Seed a worktree for a client session, checked out on `branch`.
    pub(crate) fn add_worktree(&self, client_session_id: &str, branch: &str) {
        let mut state = self.state.lock().unwrap();
        state.branches.insert(branch.to_string());
        state.worktrees.insert(
            client_session_id.to_string(),
            WorktreeRecord {
                id: format!("wt-{client_session_id}"),
                client_session_id: client_session_id.to_string(),
                path: format!("/worktrees/{client_session_id}"),
                branch_name: branch.to_string(),
                branch_renamed: false,
            },
        );
    }

    pub(crate) fn add_branch(&self, name: &str) {
        self.state.lock().unwrap().branches.insert(name.to_string());
    }

    pub(crate) fn fail_renames(&self) {
        self.state.lock().unwrap().fail_renames = true;
    }

    pub(crate) fn worktree(&self, client_session_id: &str) -> Option<WorktreeRecord> {
        self.state
            .lock()
            .unwrap()
            .worktrees
            .get(client_session_id)
            .cloned()
    }
}

#[async_trait]
impl WorktreeGit for FakeGit {
    async fn branch_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().branches.contains(name))
    }

    async fn rename_branch(
        &self,
        _worktree_path: &str,
        from: &str,
        to: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_renames {
            bail!("injected rename failure");
        }
        if !state.branches.remove(from) {
            bail!("no branch named {from}");
        }
        state.branches.insert(to.to_string());
        Ok(())
    }

    async fn worktree_for_session(
        &self,
        client_session_id: &str,
    ) -> anyhow::Result<Option<WorktreeRecord>> {
        Ok(self.worktree(client_session_id))
    }

    async fn update_worktree(
        &self,
        worktree_id: &str,
        fields: WorktreeFields,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state
            .worktrees
            .values_mut()
            .find(|worktree| worktree.id == worktree_id)
        else {
            bail!("no worktree {worktree_id}");
        };
        if let Some(branch_name) = fields.branch_name {
            record.branch_name = branch_name;
        }
        if let Some(branch_renamed) = fields.branch_renamed {
            record.branch_renamed = branch_renamed;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeStorage {
    state: StdMutex<StorageState>,
}

#[derive(Default)]
struct StorageState {
    sessions: HashMap<String, SessionRecord>,
    projects: HashMap<String, ProjectRecord>,
    messages: HashMap<(String, String), MessageRecord>,
    settings: HashMap<String, String>,
}

impl FakeStorage {
    pub(crate) fn add_project(&self, id: &str, name: &str, root_path: &str) {
        self.state.lock().unwrap().projects.insert(
            id.to_string(),
            ProjectRecord {
                id: id.to_string(),
                name: name.to_string(),
                root_path: root_path.to_string(),
            },
        );
    }

    pub(crate) fn add_session(&self, id: &str, project_id: &str, title: Option<&str>) {
        self.state.lock().unwrap().sessions.insert(
            id.to_string(),
            SessionRecord {
                id: id.to_string(),
                project_id: project_id.to_string(),
                title: title.map(String::from),
                directory: None,
                external_session_id: None,
                created_at_ms: 0,
                updated_at_ms: 0,
            },
        );
    }

    pub(crate) fn set_setting_value(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .settings
            .insert(key.to_string(), value.to_string());
    }

    pub(crate) fn setting_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().settings.get(key).cloned()
    }

    pub(crate) fn session_title(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .and_then(|session| session.title.clone())
    }

    pub(crate) fn session_external_id(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .and_then(|session| session.external_session_id.clone())
    }

    pub(crate) fn message(&self, client_session_id: &str, message_id: &str) -> Option<MessageRecord> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&(client_session_id.to_string(), message_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn session(&self, client_session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .get(client_session_id)
            .cloned())
    }

    async fn project(&self, project_id: &str) -> anyhow::Result<Option<ProjectRecord>> {
        Ok(self.state.lock().unwrap().projects.get(project_id).cloned())
    }

    async fn update_session(
        &self,
        client_session_id: &str,
        changes: SessionChanges,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .sessions
            .entry(client_session_id.to_string())
            .or_insert_with(|| SessionRecord {
                id: client_session_id.to_string(),
                project_id: String::new(),
                title: None,
                directory: None,
                external_session_id: None,
                created_at_ms: 0,
                updated_at_ms: 0,
            });
        if let Some(title) = changes.title {
            record.title = Some(title);
        }
        if let Some(external_session_id) = changes.external_session_id {
            record.external_session_id = external_session_id;
        }
        Ok(())
    }

    async fn upsert_message(&self, record: &MessageRecord) -> anyhow::Result<()> {
        self.state.lock().unwrap().messages.insert(
            (record.client_session_id.clone(), record.message_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.state.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_setting_value(key, value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Desktop
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeDesktop {
    focused: AtomicBool,
    notifications: StdMutex<Vec<SessionNotification>>,
}

impl FakeDesktop {
    pub(crate) fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    pub(crate) fn notifications(&self) -> Vec<SessionNotification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl Desktop for FakeDesktop {
    async fn window_focused(&self) -> anyhow::Result<bool> {
        Ok(self.focused.load(Ordering::SeqCst))
    }

    async fn notify(&self, notification: SessionNotification) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent server
// ---------------------------------------------------------------------------

/// An in-memory agent server: sessions spring into being on demand, and
/// tests push raw event JSON into the per-directory streams.
pub(crate) struct FakeAgentApi {
    state: Arc<StdMutex<ApiState>>,
}

#[derive(Default)]
struct ApiState {
    next_session: usize,
    next_stream: u64,
    sessions: HashMap<(String, String), SessionInfo>,
    streams: HashMap<u64, (String, mpsc::Sender<EventEnvelope>)>,
    subscribe_count: usize,
    session_info_calls: usize,
    fail_session_info: bool,
    fail_prompt: bool,
    fail_subscribe: bool,
    prompts: Vec<(String, String, Vec<PromptPart>)>,
    aborts: Vec<(String, String)>,
}

impl FakeAgentApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StdMutex::new(ApiState::default())),
        })
    }

    /// Seed a session the server already knows about.
    pub(crate) fn add_session(&self, directory: &str, session_id: &str, parent_id: Option<&str>) {
        self.state.lock().unwrap().sessions.insert(
            (directory.to_string(), session_id.to_string()),
            SessionInfo {
                id: session_id.to_string(),
                parent_id: parent_id.map(String::from),
                title: None,
                directory: Some(directory.to_string()),
                status: None,
            },
        );
    }

    pub(crate) fn set_session_status(&self, directory: &str, session_id: &str, status: &str) {
        if let Some(info) = self
            .state
            .lock()
            .unwrap()
            .sessions
            .get_mut(&(directory.to_string(), session_id.to_string()))
        {
            info.status = Some(Value::String(status.to_string()));
        }
    }

    pub(crate) fn fail_next_session_info(&self) {
        self.state.lock().unwrap().fail_session_info = true;
    }

    pub(crate) fn fail_next_prompt(&self) {
        self.state.lock().unwrap().fail_prompt = true;
    }

    pub(crate) fn fail_next_subscribe(&self) {
        self.state.lock().unwrap().fail_subscribe = true;
    }

    pub(crate) fn session_info_calls(&self) -> usize {
        self.state.lock().unwrap().session_info_calls
    }

    /// Subscribe attempts, including failed ones.
    pub(crate) fn subscribe_count(&self) -> usize {
        self.state.lock().unwrap().subscribe_count
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.state.lock().unwrap().streams.len()
    }

    pub(crate) fn has_stream(&self, directory: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .streams
            .values()
            .any(|(stream_directory, _)| stream_directory == directory)
    }

    pub(crate) fn prompts(&self) -> Vec<(String, String, Vec<PromptPart>)> {
        self.state.lock().unwrap().prompts.clone()
    }

    pub(crate) fn aborts(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().aborts.clone()
    }

    /// Push one raw event into every open stream for `directory`.
    pub(crate) fn push(&self, directory: &str, raw: Value) {
        let envelope = EventEnvelope::parse(&raw.to_string()).expect("valid event json");
        let senders: Vec<mpsc::Sender<EventEnvelope>> = self
            .state
            .lock()
            .unwrap()
            .streams
            .values()
            .filter(|(stream_directory, _)| stream_directory == directory)
            .map(|(_, tx)| tx.clone())
            .collect();
        assert!(!senders.is_empty(), "no open stream for {directory}");
        for tx in senders {
            tx.try_send(envelope.clone()).expect("stream backlog");
        }
    }
}

#[async_trait]
impl AgentApi for FakeAgentApi {
    async fn create_session(&self, directory: &str) -> Result<SessionInfo, AgentServerError> {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let info = SessionInfo {
            id: format!("ext-{}", state.next_session),
            parent_id: None,
            title: None,
            directory: Some(directory.to_string()),
            status: None,
        };
        state
            .sessions
            .insert((directory.to_string(), info.id.clone()), info.clone());
        Ok(info)
    }

    async fn session_info(
        &self,
        directory: &str,
        session_id: &str,
    ) -> Result<SessionInfo, AgentServerError> {
        let mut state = self.state.lock().unwrap();
        state.session_info_calls += 1;
        if state.fail_session_info {
            state.fail_session_info = false;
            return Err(AgentServerError::Api {
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        state
            .sessions
            .get(&(directory.to_string(), session_id.to_string()))
            .cloned()
            .ok_or_else(|| AgentServerError::Api {
                status: 404,
                body: "session not found".to_string(),
            })
    }

    async fn send_prompt(
        &self,
        directory: &str,
        session_id: &str,
        parts: &[PromptPart],
    ) -> Result<(), AgentServerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_prompt {
            state.fail_prompt = false;
            return Err(AgentServerError::Api {
                status: 500,
                body: "injected prompt failure".to_string(),
            });
        }
        state
            .prompts
            .push((directory.to_string(), session_id.to_string(), parts.to_vec()));
        Ok(())
    }

    async fn abort(&self, directory: &str, session_id: &str) -> Result<(), AgentServerError> {
        self.state
            .lock()
            .unwrap()
            .aborts
            .push((directory.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn subscribe(
        &self,
        directory: &str,
        cancel: CancellationToken,
    ) -> Result<EventSubscription, AgentServerError> {
        let (tx, rx) = mpsc::channel(64);
        let stream_id = {
            let mut state = self.state.lock().unwrap();
            state.subscribe_count += 1;
            if state.fail_subscribe {
                state.fail_subscribe = false;
                return Err(AgentServerError::ChannelClosed);
            }
            state.next_stream += 1;
            let stream_id = state.next_stream;
            state
                .streams
                .insert(stream_id, (directory.to_string(), tx));
            stream_id
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            state.lock().unwrap().streams.remove(&stream_id);
        });
        Ok(EventSubscription::from_receiver(rx))
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Launcher that hands out the fake agent server instead of spawning a
/// subprocess. `kill_server` drives the unexpected-death path.
pub(crate) struct FakeLauncher {
    api: Arc<FakeAgentApi>,
    delay: Option<Duration>,
    launches: AtomicUsize,
    fail_next: AtomicBool,
    exits: StdMutex<Vec<oneshot::Sender<String>>>,
}

impl FakeLauncher {
    pub(crate) fn new(api: Arc<FakeAgentApi>) -> Arc<Self> {
        Self::build(api, None)
    }

    pub(crate) fn with_delay(api: Arc<FakeAgentApi>, delay: Duration) -> Arc<Self> {
        Self::build(api, Some(delay))
    }

    fn build(api: Arc<FakeAgentApi>, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            api,
            delay,
            launches: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            exits: StdMutex::new(Vec::new()),
        })
    }

    /// Successful launches so far.
    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Simulate the newest server subprocess dying with `status`.
    pub(crate) fn kill_server(&self, status: &str) {
        let sender = self
            .exits
            .lock()
            .unwrap()
            .pop()
            .expect("a server is running");
        let _ = sender.send(status.to_string());
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(
        &self,
        _shutdown: CancellationToken,
    ) -> Result<LaunchedServer, AgentServerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AgentServerError::Spawn("injected launch failure".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().push(tx);
        Ok(LaunchedServer {
            api: self.api.clone(),
            exited: rx,
        })
    }
}
