//! Supervised language-server sessions for symbol-level edits.
//!
//! [`SessionManager`] keeps one [`BackendSession`] per language. Each session
//! multiplexes concurrent requests over a single backend, negotiates
//! capabilities, and restarts the backend with backoff when it dies.
//! Symbol trees are cached by file content hash in a [`SymbolCache`].

mod cache;
mod capabilities;
pub mod codec;
mod error;
mod manager;
mod multiplexer;
mod process;
mod protocol;
mod session;
mod symbols;
mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::{CacheLookup, CacheStats, SymbolCache, SymbolCacheEntry};
pub use capabilities::{Capabilities, Capability, TextSync};
pub use error::LspError;
pub use manager::SessionManager;
pub use multiplexer::{CANCEL_METHOD, Multiplexer, NotificationSink};
pub use process::{
    BackendProcess, BackendSpawner, BoxedReader, BoxedWriter, ENV_SECRET_DENYLIST,
    ProcessSpawner, SpawnFut, Transport,
};
pub use protocol::{
    PathToUriError, Position, Range, TextEdit, WorkspaceEdit, file_uri_to_path, path_to_file_uri,
};
pub use session::{BackendSession, EditLease};
pub use symbols::{ResolveError, ResolvedSymbol, SymbolNode, SymbolTree};
pub use types::{
    LaunchResolver, LaunchSpec, LspConfig, RestartPolicy, ServerConfig, SessionState,
    builtin_servers,
};
