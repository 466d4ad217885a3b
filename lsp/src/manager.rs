//! Session registry: one lazily started backend per language.
//!
//! The manager routes files to languages by extension, starts sessions on
//! first use, and owns the symbol cache shared by all of them. Sessions for
//! different languages never wait on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_types::{ContentHash, LanguageId};
use tokio::sync::OnceCell;

use crate::cache::{CacheLookup, SymbolCache};
use crate::error::LspError;
use crate::process::{BackendSpawner, ProcessSpawner};
use crate::session::{BackendSession, SessionSettings};
use crate::symbols::SymbolTree;
use crate::types::{LaunchResolver, LspConfig, SessionState};

type SessionSlot = Arc<OnceCell<Arc<BackendSession>>>;

/// Build extension → language map from config.
fn build_extension_map(config: &LspConfig) -> HashMap<String, LanguageId> {
    let mut extension_map: HashMap<String, LanguageId> = HashMap::new();
    // `servers` is ordered, so the first name in sorted order wins on overlap.
    for (name, server) in &config.servers {
        let Ok(language) = LanguageId::new(name) else {
            tracing::warn!("Ignoring backend with empty language name");
            continue;
        };
        for ext in &server.file_extensions {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if let Some(existing) = extension_map.get(&ext) {
                tracing::warn!(
                    "Multiple backends configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext, language.clone());
        }
    }
    extension_map
}

pub struct SessionManager {
    workspace_root: PathBuf,
    resolver: Arc<dyn LaunchResolver>,
    spawner: Arc<dyn BackendSpawner>,
    settings: SessionSettings,
    extension_map: HashMap<String, LanguageId>,
    sessions: Mutex<HashMap<LanguageId, SessionSlot>>,
    cache: Arc<SymbolCache>,
}

impl SessionManager {
    /// Manager that launches real executables.
    pub fn new(config: LspConfig, workspace_root: impl Into<PathBuf>) -> Self {
        Self::with_spawner(config, workspace_root, Arc::new(ProcessSpawner))
    }

    pub fn with_spawner(
        config: LspConfig,
        workspace_root: impl Into<PathBuf>,
        spawner: Arc<dyn BackendSpawner>,
    ) -> Self {
        let extension_map = build_extension_map(&config);
        let settings = SessionSettings::from(&config);
        let cache = Arc::new(SymbolCache::new(config.cache_max_entries));
        Self {
            workspace_root: workspace_root.into(),
            resolver: Arc::new(config),
            spawner,
            settings,
            extension_map,
            sessions: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Replace how launch specs are resolved. Extension routing still
    /// follows the configured servers.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn LaunchResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<LanguageId, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SymbolCache> {
        &self.cache
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }

    /// Language that owns `path`, by file extension.
    #[must_use]
    pub fn language_for_path(&self, path: &Path) -> Option<LanguageId> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.extension_map.get(&ext).cloned()
    }

    /// The session for `language`, started on first use.
    pub async fn get_session(&self, language: &LanguageId) -> Result<Arc<BackendSession>, LspError> {
        let slot = Arc::clone(self.sessions().entry(language.clone()).or_default());
        let session = slot
            .get_or_try_init(|| async {
                let spec = self
                    .resolver
                    .launch_spec(language, &self.workspace_root)
                    .ok_or_else(|| LspError::Unavailable {
                        language: language.clone(),
                        reason: "no backend configured".to_string(),
                    })?;
                BackendSession::start(
                    language.clone(),
                    spec,
                    Arc::clone(&self.spawner),
                    self.settings,
                    Arc::clone(&self.cache),
                )
                .await
            })
            .await?;

        if session.state().is_terminal() {
            return Err(LspError::Unavailable {
                language: language.clone(),
                reason: "backend stopped after exhausting restarts".to_string(),
            });
        }
        Ok(Arc::clone(session))
    }

    fn existing_session(&self, language: &LanguageId) -> Option<Arc<BackendSession>> {
        self.sessions()
            .get(language)
            .and_then(|slot| slot.get().cloned())
    }

    /// Symbols of `path` via the cache, asking `session` on a miss.
    ///
    /// `hash` must be the hash of `text`, the file's current content.
    pub async fn symbol_tree(
        &self,
        session: &BackendSession,
        path: &Path,
        text: &str,
        hash: &ContentHash,
    ) -> Result<Arc<SymbolTree>, LspError> {
        if let CacheLookup::Hit(tree) = self.cache.lookup(path, hash) {
            tracing::debug!(path = %path.display(), "Symbol cache hit");
            return Ok(tree);
        }
        let tree = Arc::new(session.document_symbols(path, text).await?);
        self.cache
            .store(path, session.language(), *hash, Arc::clone(&tree));
        Ok(tree)
    }

    /// Current state of a started session.
    #[must_use]
    pub fn session_state(&self, language: &LanguageId) -> Option<SessionState> {
        self.existing_session(language).map(|s| s.state())
    }

    /// Wait for a started session to become usable.
    pub async fn wait_ready(&self, language: &LanguageId, timeout: Duration) -> Result<(), LspError> {
        match self.existing_session(language) {
            Some(session) => session.wait_ready(timeout).await,
            None => Err(LspError::Unavailable {
                language: language.clone(),
                reason: "session not started".to_string(),
            }),
        }
    }

    /// Languages with a started session, sorted.
    #[must_use]
    pub fn active_languages(&self) -> Vec<LanguageId> {
        let mut languages: Vec<LanguageId> = self
            .sessions()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(language, _)| language.clone())
            .collect();
        languages.sort();
        languages
    }

    /// Stop every session. The manager is empty afterwards.
    pub async fn shutdown(&self) {
        let slots: Vec<(LanguageId, SessionSlot)> = self.sessions().drain().collect();
        for (language, slot) in slots {
            if let Some(session) = slot.get() {
                tracing::info!(language = %language, "Shutting down backend session");
                session.shutdown().await;
            }
        }
    }
}
