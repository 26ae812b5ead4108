// Intake health shared between the queue loop and the readiness endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use sentinel_engine::admission::Admission;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct Health {
    halted: AtomicBool,
    draining: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Health {
    /// Stop intake until a re-probe succeeds
    pub fn halt(&self, reason: impl Into<String>) {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        !self.is_halted() && !self.draining.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ReadyState {
    pub health: Arc<Health>,
    pub admission: Admission,
}

/// GET /ready - 200 while popping submissions, 503 while halted or draining
async fn ready(State(state): State<ReadyState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "ready": state.health.is_ready(),
        "halted": state.health.is_halted(),
        "reason": state.health.reason(),
        "in_flight": state.admission.in_flight(),
    });
    let status = if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

pub fn router(state: ReadyState) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}
