//! One supervised backend per language.
//!
//! A session owns the current backend instance (multiplexer, process,
//! negotiated capabilities, open documents) and a supervisor task that
//! watches it. When the instance dies the supervisor marks the session
//! `Crashed`, fails everything pending, drops the language's cache entries,
//! and relaunches with backoff until the restart budget runs out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tether_types::LanguageId;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, watch};
use tokio::task::JoinHandle;

use crate::cache::SymbolCache;
use crate::capabilities::{Capabilities, Capability, TextSync};
use crate::error::LspError;
use crate::multiplexer::{Multiplexer, NotificationSink};
use crate::process::{BackendProcess, BackendSpawner};
use crate::protocol::{self, Position, WorkspaceEdit};
use crate::symbols::SymbolTree;
use crate::types::{LaunchSpec, LspConfig, RestartPolicy, SessionState};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub request_timeout: Duration,
    pub health_check_interval: Duration,
    pub restart: RestartPolicy,
}

impl From<&LspConfig> for SessionSettings {
    fn from(config: &LspConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            health_check_interval: config.health_check_interval(),
            restart: config.restart,
        }
    }
}

/// One launched backend. Replaced wholesale on restart.
struct Instance {
    generation: u64,
    mux: Multiplexer,
    capabilities: Capabilities,
    process: tokio::sync::Mutex<Option<BackendProcess>>,
    /// Open documents by URI, with the last version sent.
    documents: tokio::sync::Mutex<HashMap<String, i32>>,
}

impl Instance {
    /// Fail pending requests and reap the process.
    async fn teardown(&self, graceful: bool) {
        if graceful
            && self
                .mux
                .call("shutdown", None, SHUTDOWN_TIMEOUT)
                .await
                .is_ok()
        {
            let _ = self.mux.notify("exit", None).await;
        }
        self.mux.close().await;
        if let Some(process) = self.process.lock().await.as_mut() {
            if graceful {
                process.terminate().await;
            } else {
                process.kill().await;
            }
        }
    }
}

async fn until_true(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

pub struct BackendSession {
    language: LanguageId,
    launch: LaunchSpec,
    spawner: Arc<dyn BackendSpawner>,
    settings: SessionSettings,
    cache: Arc<SymbolCache>,
    state_tx: watch::Sender<SessionState>,
    instance: RwLock<Option<Arc<Instance>>>,
    generation: AtomicU64,
    restarts: AtomicU32,
    /// Edits hold it shared; restart takes it exclusively.
    edit_lease: Arc<RwLock<()>>,
    active_edits: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BackendSession {
    /// Launch, handshake, and start supervising.
    pub(crate) async fn start(
        language: LanguageId,
        launch: LaunchSpec,
        spawner: Arc<dyn BackendSpawner>,
        settings: SessionSettings,
        cache: Arc<SymbolCache>,
    ) -> Result<Arc<Self>, LspError> {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let (shutdown_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            language,
            launch,
            spawner,
            settings,
            cache,
            state_tx,
            instance: RwLock::new(None),
            generation: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            edit_lease: Arc::new(RwLock::new(())),
            active_edits: AtomicUsize::new(0),
            shutdown_tx,
            supervisor: Mutex::new(None),
        });

        tracing::info!(
            language = %session.language,
            program = %session.launch.program,
            "Starting backend session"
        );
        match session.launch_instance().await {
            Ok(instance) => {
                *session.instance.write().await = Some(instance);
                session.state_tx.send_replace(SessionState::Ready);
            }
            Err(e) => {
                tracing::warn!(language = %session.language, "Backend failed to start: {e}");
                session.state_tx.send_replace(SessionState::Stopped);
                return Err(e);
            }
        }

        let handle = tokio::spawn(supervise(Arc::downgrade(&session)));
        *session
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::info!(language = %session.language, "Backend session ready");
        Ok(session)
    }

    #[must_use]
    pub fn language(&self) -> &LanguageId {
        &self.language
    }

    #[must_use]
    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Successful restarts since the session started.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.instance
            .read()
            .await
            .as_ref()
            .map(|i| i.capabilities.clone())
    }

    /// Ids of requests in flight on the current instance.
    pub async fn pending_ids(&self) -> Vec<u64> {
        match self.instance.read().await.as_ref() {
            Some(instance) => instance.mux.pending_ids(),
            None => Vec::new(),
        }
    }

    /// Wait until the session is usable again.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), LspError> {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_usable() || s.is_terminal())
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(state)) if state.is_usable() => Ok(()),
            Ok(_) => Err(self.stopped()),
            Err(_) => Err(LspError::Timeout {
                method: "wait_ready".to_string(),
                elapsed: timeout,
            }),
        }
    }

    fn stopped(&self) -> LspError {
        LspError::Unavailable {
            language: self.language.clone(),
            reason: "backend stopped".to_string(),
        }
    }

    fn crashed(&self) -> LspError {
        LspError::Crashed {
            language: self.language.clone(),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn ready_instance(&self) -> Result<Arc<Instance>, LspError> {
        match self.state() {
            SessionState::Stopped => return Err(self.stopped()),
            s if !s.is_usable() => return Err(self.crashed()),
            _ => {}
        }
        self.instance
            .read()
            .await
            .clone()
            .ok_or_else(|| self.crashed())
    }

    fn require(&self, instance: &Instance, capability: Capability) -> Result<(), LspError> {
        if instance.capabilities.supports(capability) {
            Ok(())
        } else {
            Err(LspError::Unsupported {
                language: self.language.clone(),
                capability,
            })
        }
    }

    /// Take the edit lease. Restarts wait until every lease is released.
    pub async fn edit_lease(self: &Arc<Self>) -> Result<EditLease, LspError> {
        let guard = Arc::clone(&self.edit_lease).read_owned().await;
        self.ready_instance().await?;
        if self.active_edits.fetch_add(1, Ordering::SeqCst) == 0 {
            self.state_tx.send_if_modified(|s| {
                if *s == SessionState::Ready {
                    *s = SessionState::Busy;
                    true
                } else {
                    false
                }
            });
        }
        Ok(EditLease {
            session: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Issue `method`, retrying once on a protocol error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        let instance = self.ready_instance().await?;
        self.call_with_retry(&instance, method, params).await
    }

    async fn call_with_retry(
        &self,
        instance: &Instance,
        method: &str,
        params: Value,
    ) -> Result<Value, LspError> {
        let timeout = self.settings.request_timeout;
        match instance.mux.call(method, Some(params.clone()), timeout).await {
            Err(LspError::Protocol { code, message, .. }) => {
                tracing::debug!(
                    language = %self.language,
                    method,
                    ?code,
                    %message,
                    "Retrying after protocol error"
                );
                instance.mux.call(method, Some(params), timeout).await
            }
            other => other,
        }
    }

    fn uri(&self, method: &str, path: &Path) -> Result<String, LspError> {
        protocol::path_to_file_uri(path)
            .map(|u| u.to_string())
            .map_err(|e| LspError::protocol(method, e.to_string()))
    }

    async fn sync_document(&self, instance: &Instance, uri: &str, text: &str) -> Result<(), LspError> {
        if instance.capabilities.text_sync() == TextSync::None {
            return Ok(());
        }
        let mut documents = instance.documents.lock().await;
        if let Some(version) = documents.get_mut(uri) {
            *version += 1;
            let params = protocol::did_change_params(uri, *version, text);
            instance
                .mux
                .notify("textDocument/didChange", Some(params))
                .await
        } else {
            documents.insert(uri.to_string(), 1);
            let params = protocol::did_open_params(uri, &self.launch.language_id, 1, text);
            instance.mux.notify("textDocument/didOpen", Some(params)).await
        }
    }

    /// Symbols of `path`, whose current content is `text`.
    pub async fn document_symbols(&self, path: &Path, text: &str) -> Result<SymbolTree, LspError> {
        const METHOD: &str = "textDocument/documentSymbol";
        let instance = self.ready_instance().await?;
        self.require(&instance, Capability::DocumentSymbol)?;
        let uri = self.uri(METHOD, path)?;
        self.sync_document(&instance, &uri, text).await?;
        let result = self
            .call_with_retry(&instance, METHOD, protocol::document_symbol_params(&uri))
            .await?;
        SymbolTree::from_response(METHOD, result)
    }

    /// Ask the backend for the edits that rename the symbol at `position`.
    pub async fn rename(
        &self,
        path: &Path,
        text: &str,
        position: Position,
        new_name: &str,
    ) -> Result<WorkspaceEdit, LspError> {
        const METHOD: &str = "textDocument/rename";
        let instance = self.ready_instance().await?;
        self.require(&instance, Capability::Rename)?;
        let uri = self.uri(METHOD, path)?;
        self.sync_document(&instance, &uri, text).await?;
        let result = self
            .call_with_retry(
                &instance,
                METHOD,
                protocol::rename_params(&uri, position, new_name),
            )
            .await?;
        WorkspaceEdit::from_value(METHOD, result)
    }

    /// Tell the backend `path` now contains `text`.
    pub async fn document_changed(&self, path: &Path, text: &str) -> Result<(), LspError> {
        let instance = self.ready_instance().await?;
        let uri = self.uri("textDocument/didChange", path)?;
        self.sync_document(&instance, &uri, text).await
    }

    /// Graceful `shutdown`/`exit`, then reap. The session ends `Stopped`.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        let _lease = self.edit_lease.write().await;
        let instance = self.instance.write().await.take();
        if let Some(instance) = instance {
            instance.teardown(true).await;
        }
        self.state_tx.send_replace(SessionState::Stopped);
        tracing::info!(language = %self.language, "Backend session stopped");
    }

    async fn launch_instance(&self) -> Result<Arc<Instance>, LspError> {
        let transport = self.spawner.spawn(&self.language, &self.launch).await?;
        let mux = Multiplexer::start(
            self.language.clone(),
            transport.reader,
            transport.writer,
            self.notification_sink(),
        );
        let mut process = transport.process;

        match self.handshake(&mux).await {
            Ok(capabilities) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    language = %self.language,
                    generation,
                    pid = process.as_ref().and_then(BackendProcess::pid),
                    ?capabilities,
                    "Backend initialized"
                );
                Ok(Arc::new(Instance {
                    generation,
                    mux,
                    capabilities,
                    process: tokio::sync::Mutex::new(process),
                    documents: tokio::sync::Mutex::new(HashMap::new()),
                }))
            }
            Err(e) => {
                mux.close().await;
                if let Some(process) = process.as_mut() {
                    process.kill().await;
                }
                Err(LspError::Launch {
                    language: self.language.clone(),
                    message: format!("initialize failed: {e}"),
                })
            }
        }
    }

    async fn handshake(&self, mux: &Multiplexer) -> Result<Capabilities, LspError> {
        let root_uri = self.uri("initialize", &self.launch.working_dir)?;
        let result = mux
            .call(
                "initialize",
                Some(protocol::initialize_params(&root_uri)),
                self.settings.request_timeout,
            )
            .await?;
        let capabilities =
            Capabilities::from_server(result.get("capabilities").unwrap_or(&Value::Null));
        mux.notify("initialized", Some(serde_json::json!({})))
            .await?;
        Ok(capabilities)
    }

    /// Notifications naming a document make its cached symbols stale.
    fn notification_sink(&self) -> NotificationSink {
        let cache = Arc::clone(&self.cache);
        let language = self.language.clone();
        Arc::new(move |method, params| {
            let uri = params
                .and_then(|p| {
                    p.get("uri")
                        .or_else(|| p.get("textDocument").and_then(|d| d.get("uri")))
                })
                .and_then(Value::as_str);
            match uri.and_then(protocol::file_uri_to_path) {
                Some(path) => {
                    cache.invalidate_path(&path);
                }
                None => {
                    tracing::trace!(language = %language, method, "Ignoring notification");
                }
            }
        })
    }

    async fn current_instance(&self) -> Option<Arc<Instance>> {
        self.instance.read().await.clone()
    }

    /// Relaunch after a crash. Returns `true` once `Ready` again.
    async fn recover(&self, reason: &str) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        tracing::warn!(language = %self.language, reason, "Backend crashed");
        self.state_tx.send_replace(SessionState::Crashed);
        let old = self.instance.write().await.take();
        if let Some(old) = old {
            old.teardown(false).await;
        }
        self.cache.invalidate_language(&self.language);

        let policy = self.settings.restart;
        let mut shutdown = self.shutdown_tx.subscribe();
        for attempt in 1..=policy.max_restarts {
            tokio::select! {
                () = tokio::time::sleep(policy.backoff(attempt)) => {}
                () = until_true(&mut shutdown) => return false,
            }

            let _lease = self.edit_lease.write().await;
            if self.is_shutting_down() {
                return false;
            }
            self.state_tx.send_replace(SessionState::Restarting);
            tracing::info!(language = %self.language, attempt, "Restarting backend");

            match self.launch_instance().await {
                Ok(instance) => {
                    let generation = instance.generation;
                    *self.instance.write().await = Some(instance);
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    self.state_tx.send_replace(SessionState::Ready);
                    tracing::info!(language = %self.language, generation, "Backend restarted");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(language = %self.language, attempt, "Restart failed: {e}");
                }
            }
        }

        tracing::warn!(
            language = %self.language,
            max_restarts = policy.max_restarts,
            "Restart budget exhausted, stopping backend"
        );
        self.state_tx.send_replace(SessionState::Stopped);
        false
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Watchdog loop. Holds only a weak reference between checks.
async fn supervise(weak: Weak<BackendSession>) {
    loop {
        let Some(session) = weak.upgrade() else {
            return;
        };
        let Some(instance) = session.current_instance().await else {
            return;
        };
        let mut closed = instance.mux.closed();
        let mut shutdown = session.shutdown_tx.subscribe();
        let interval = session.settings.health_check_interval;
        drop(session);

        let reason = loop {
            tokio::select! {
                () = until_true(&mut closed) => break "channel closed",
                () = until_true(&mut shutdown) => return,
                () = tokio::time::sleep(interval) => {
                    let mut process = instance.process.lock().await;
                    if let Some(process) = process.as_mut()
                        && !process.is_alive()
                    {
                        break "process exited";
                    }
                }
            }
        };
        drop(instance);

        let Some(session) = weak.upgrade() else {
            return;
        };
        if !session.recover(reason).await {
            return;
        }
    }
}

/// Shared hold on a session for the duration of one edit.
pub struct EditLease {
    session: Arc<BackendSession>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl EditLease {
    #[must_use]
    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }
}

impl Drop for EditLease {
    fn drop(&mut self) {
        if self.session.active_edits.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.state_tx.send_if_modified(|s| {
                if *s == SessionState::Busy {
                    *s = SessionState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }
}
