use std::sync::Arc;

use overdrop_engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth_token: Arc<String>,
}
