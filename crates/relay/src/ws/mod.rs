pub mod handler;
pub mod protocol;

use std::time::Duration;

use axum::{routing::get, Router};

use crate::registry::ClientRegistry;
use crate::router::MessageRouter;

/// State shared by every signaling socket.
#[derive(Debug, Clone)]
pub struct SignalingState {
    pub registry: ClientRegistry,
    pub router: MessageRouter,
    pub request_username: bool,
    /// How long a socket may stay open without registering.
    pub registration_timeout: Duration,
}

impl SignalingState {
    pub fn new(registry: ClientRegistry, request_username: bool) -> Self {
        let router = MessageRouter::new(registry.clone());
        Self { registry, router, request_username, registration_timeout: Duration::from_secs(30) }
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }
}

pub fn router(state: SignalingState) -> Router {
    Router::new().route("/ws", get(handler::ws_upgrade)).with_state(state)
}
