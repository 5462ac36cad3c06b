use std::sync::Arc;

use calsync_core::SyncEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> AppState {
        AppState { engine }
    }
}
