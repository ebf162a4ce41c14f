use crate::config::Configuration;
use axum::extract::FromRef;
use prometheus::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub configuration: Arc<Configuration>,
    pub registry: Registry,
}

impl FromRef<AppState> for Registry {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}
