use mtbridge_core::TerminalBridge;
use std::sync::Arc;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub bridge: Arc<dyn TerminalBridge>,
}

impl AppState {
    pub fn new(bridge: Arc<dyn TerminalBridge>) -> Self {
        Self { bridge }
    }
}
