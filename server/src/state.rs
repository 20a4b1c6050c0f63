//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::ApiKey;
use crate::config::Config;
use crate::sessions::{RegistrySettings, SessionRegistry};
use crate::tunnel::Dialer;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub api_key: ApiKey,
    /// Local sessions. Stays empty in remote mode.
    pub registry: SessionRegistry,
    /// Shared by the remote relay and the editor proxy.
    pub dialer: Dialer,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(RegistrySettings::from_config(&config));
        Self {
            api_key: ApiKey(config.auth.api_key.clone()),
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            dialer: Dialer::new(),
        }
    }
}
