use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use super::dispatcher::AlertBatch;
use super::Server;
use crate::metrics::{ERR_STAGE_READ, ERR_STAGE_UNMARSHAL};
use crate::release;

/// Webhook endpoint for alertmanager. Unpacks the batch and dispatches it;
/// any accumulated error turns into a 500 so alertmanager may re-notify.
pub async fn webhook(State(server): State<Arc<Server>>, body: Body) -> impl IntoResponse {
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            server
                .metrics
                .errors
                .with_label_values(&[ERR_STAGE_READ])
                .inc();
            error!("Failed to read alert payload: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let batch: AlertBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            server
                .metrics
                .errors
                .with_label_values(&[ERR_STAGE_UNMARSHAL])
                .inc();
            error!("Failed to decode alert payload: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    info!(
        "Webhook received {} alert(s) for receiver {:?}",
        batch.alerts.len(),
        batch.receiver
    );

    let errors = server.handle_batch(batch).await;
    if errors.is_empty() {
        (StatusCode::OK, String::new())
    } else {
        let message = errors.join("\n");
        error!("{}", message);
        (StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

pub async fn health() -> &'static str {
    "All systems are functioning within normal specifications.\n"
}

pub async fn metrics(State(server): State<Arc<Server>>) -> String {
    server.metrics.gather()
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub alert_name: String,
}

pub async fn release(
    State(server): State<Arc<Server>>,
    Json(payload): Json<ReleaseRequest>,
) -> impl IntoResponse {
    info!("Release requested for alert: {}", payload.alert_name);
    match release::release_alert(&server, &payload.alert_name).await {
        Ok(()) => (
            StatusCode::OK,
            format!("released alert {}\n", payload.alert_name),
        ),
        Err(e) => {
            error!("Failed to release alert {}: {}", payload.alert_name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
