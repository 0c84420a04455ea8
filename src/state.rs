//! Shared application state handed to the HTTP and IPC surfaces.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::orchestrator::Engine;

/// State shared by every request handler.
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<GlobalConfig>,
    /// Lifecycle components.
    pub engine: Engine,
    /// Shared secret the ctl binary must present; `None` disables the check.
    pub ipc_auth_token: Option<String>,
}
