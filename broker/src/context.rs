//! Shared application state handed to every axum handler.

use std::time::Duration;

use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub shutdown_grace: Duration,
}

impl AppState {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            registry: Registry::new(),
            shutdown_grace,
        }
    }
}
