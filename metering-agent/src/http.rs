use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use ledger_client::LedgerStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;

use crate::{
    config::AppConfig,
    emit::{EmissionReport, Emitter, SendMeteringRequest},
    error::ApiError,
    ingest::{reject_invalid_signature, Ingestor},
    report::{build_daily_report, resolve_date, DailyReport},
    signing::{Signer, SIGNATURE_HEADER},
};

pub const ACK_STATUS: &str = "ACK";

/// Shared handles injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub ingestor: Arc<Ingestor>,
    pub emitter: Arc<Emitter>,
}

impl AppState {
    pub fn from_config(cfg: &AppConfig, store: Arc<dyn LedgerStore>) -> anyhow::Result<Self> {
        let signer = Signer::new(&cfg.signing.shared_secret)?;
        let ingestor = Ingestor::new(store.clone(), signer.clone(), cfg.validation.clone());
        let emitter = Emitter::new(&cfg.emission, signer, store.clone(), cfg.validation.clone())?;

        Ok(Self {
            store,
            ingestor: Arc::new(ingestor),
            emitter: Arc::new(emitter),
        })
    }
}

/// Inbound envelope. Only `context` and `message` take part in signing;
/// any other top-level keys are dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct MeteringMessage {
    pub context: Map<String, Value>,
    pub message: Map<String, Value>,
}

impl MeteringMessage {
    pub fn into_payload(self) -> Value {
        let mut payload = Map::new();
        payload.insert("context".to_string(), Value::Object(self.context));
        payload.insert("message".to_string(), Value::Object(self.message));
        Value::Object(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
    pub record_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ack: Ack,
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    date: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/on_metering", post(on_metering))
        .route("/send_metering", post(send_metering))
        .route("/report/daily_aggregates", get(daily_aggregates))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn on_metering(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(msg): Json<MeteringMessage>,
) -> Result<Json<AckResponse>, ApiError> {
    // A header that is present but not visible ASCII can never match a hex
    // digest; it must not fall through to the unsigned path.
    let signature = match headers.get(SIGNATURE_HEADER).map(|v| v.to_str()) {
        Some(Ok(sig)) => Some(sig),
        Some(Err(_)) => return Err(reject_invalid_signature()),
        None => None,
    };
    let record_id = state.ingestor.ingest(msg.into_payload(), signature).await?;

    Ok(Json(AckResponse {
        ack: Ack {
            status: ACK_STATUS.to_string(),
            record_id,
        },
    }))
}

async fn send_metering(
    State(state): State<AppState>,
    Json(req): Json<SendMeteringRequest>,
) -> Result<Json<EmissionReport>, ApiError> {
    Ok(Json(state.emitter.send(req).await?))
}

async fn daily_aggregates(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<DailyReport>, ApiError> {
    let date = resolve_date(query.date.as_deref()).map_err(|e| ApiError::BadQuery(e.to_string()))?;
    let report = build_daily_report(state.store.as_ref(), date).await?;
    Ok(Json(report))
}
