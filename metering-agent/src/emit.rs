use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use ledger_client::{
    domain::timestamp::{self, now_utc},
    LedgerStore, NewRecord, RecordSource, Trust,
};
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    canonical::canonical_bytes,
    config::{EmissionConfig, ValidationConfig},
    error::ApiError,
    signing::{Signer, SIGNATURE_HEADER},
    validation::{validate_reading, ValidationError},
};

pub const ENVELOPE_DOMAIN: &str = "energy.metering";
pub const ENVELOPE_ACTION: &str = "metering";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendMeteringRequest {
    pub target_url: String,
    pub obp_id: String,
    pub meter_id: String,
    pub value_kwh: f64,
}

/// What the remote end said, or a synthetic 502/504 when it never answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub status_code: u16,
    pub resp_text: String,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    fn is_retryable(&self) -> bool {
        self.status_code >= 500
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionReport {
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
    pub record_id: String,
}

/// Builds, signs and delivers outbound metering envelopes, and records
/// every send in the ledger whatever the delivery outcome.
pub struct Emitter {
    client: reqwest::Client,
    signer: Signer,
    store: Arc<dyn LedgerStore>,
    sender_id: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    policy: ValidationConfig,
}

impl Emitter {
    pub fn new(
        config: &EmissionConfig,
        signer: Signer,
        store: Arc<dyn LedgerStore>,
        policy: ValidationConfig,
    ) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build outbound HTTP client")?;

        Ok(Self {
            client,
            signer,
            store,
            sender_id: config.sender_id.clone(),
            timeout,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            policy,
        })
    }

    /// Envelope for one reading; `now` stamps both the context and the
    /// metering block.
    pub fn build_envelope(&self, req: &SendMeteringRequest, transaction_id: &str, now: OffsetDateTime) -> Value {
        let ts = timestamp::to_storage_string(now);
        json!({
            "context": {
                "domain": ENVELOPE_DOMAIN,
                "action": ENVELOPE_ACTION,
                "bpp_id": self.sender_id,
                "transaction_id": transaction_id,
                "timestamp": ts,
            },
            "message": {
                "metering": {
                    "obp_id": req.obp_id,
                    "meter_id": req.meter_id,
                    "value_kwh": req.value_kwh,
                    "timestamp": ts,
                }
            }
        })
    }

    pub async fn send(&self, req: SendMeteringRequest) -> Result<EmissionReport, ApiError> {
        let target = parse_target(&req.target_url)?;
        let now = now_utc();
        validate_reading(req.value_kwh, now, &self.policy)?;

        let transaction_id = Uuid::new_v4().to_string();
        let envelope = self.build_envelope(&req, &transaction_id, now);
        let signature = self.signer.sign(&envelope);
        let body = canonical_bytes(&envelope);

        let outcome = self.deliver(&target, body, &signature).await;
        if !outcome.is_success() {
            metrics::counter!("metering_emission_failures_total").increment(1);
        }

        // The send is recorded even when delivery failed.
        let record_id = self
            .store
            .insert(NewRecord {
                obp_id: Some(req.obp_id),
                meter_id: req.meter_id.clone(),
                timestamp_utc: now,
                value_kwh: req.value_kwh,
                source: RecordSource::Sent,
                trust: Trust::Local,
                signature,
                raw_payload: envelope,
            })
            .await?;
        metrics::counter!("metering_records_appended_total", "source" => "sent").increment(1);

        tracing::info!(
            record_id = %record_id,
            transaction_id = %transaction_id,
            meter_id = %req.meter_id,
            url = %target,
            status_code = outcome.status_code,
            "metering message emitted"
        );

        Ok(EmissionReport { outcome, record_id })
    }

    async fn deliver(&self, target: &Url, body: Vec<u8>, signature: &str) -> DeliveryOutcome {
        let mut attempt: u32 = 0;
        loop {
            let outcome = self.attempt(target, body.clone(), signature).await;

            if !outcome.is_retryable() || attempt >= self.max_retries {
                if outcome.is_retryable() && self.max_retries > 0 {
                    tracing::error!(
                        status_code = outcome.status_code,
                        attempts = attempt + 1,
                        "metering delivery failed, giving up"
                    );
                }
                return outcome;
            }

            attempt += 1;
            let sleep_for = self.retry_backoff * attempt;
            tracing::warn!(
                status_code = outcome.status_code,
                attempt,
                "metering delivery failed, retrying with backoff"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn attempt(&self, target: &Url, body: Vec<u8>, signature: &str) -> DeliveryOutcome {
        metrics::counter!("metering_emission_attempts_total").increment(1);
        let started = Instant::now();

        let res = self
            .client
            .post(target.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        let outcome = match res {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let resp_text = match resp.text().await {
                    Ok(text) => text,
                    Err(e) => format!("failed to read response body: {e}"),
                };
                DeliveryOutcome { status_code, resp_text }
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!(error = %e, url = %target, "metering delivery timed out");
                DeliveryOutcome {
                    status_code: StatusCode::GATEWAY_TIMEOUT.as_u16(),
                    resp_text: format!("delivery timed out after {}s: {e}", self.timeout.as_secs()),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %target, "metering delivery failed");
                DeliveryOutcome {
                    status_code: StatusCode::BAD_GATEWAY.as_u16(),
                    resp_text: format!("delivery failed: {e}"),
                }
            }
        };

        metrics::histogram!("metering_emission_latency_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }
}

fn parse_target(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| ValidationError::TargetUrl(format!("'{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::TargetUrl(format!("unsupported scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::MemoryLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    fn emitter(store: Arc<MemoryLedger>, max_retries: u32) -> Emitter {
        let config = EmissionConfig {
            sender_id: "agent.test".to_string(),
            timeout_secs: 2,
            max_retries,
            retry_backoff_ms: 10,
        };
        Emitter::new(&config, Signer::new("test-secret").unwrap(), store, ValidationConfig::default()).unwrap()
    }

    fn request(target_url: &str) -> SendMeteringRequest {
        SendMeteringRequest {
            target_url: target_url.to_string(),
            obp_id: "obp-42".to_string(),
            meter_id: "M1".to_string(),
            value_kwh: 1.25,
        }
    }

    /// Address that refuses connections: bind, read the port, release it.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/on_metering")
    }

    #[test]
    fn envelope_carries_context_and_metering_block() {
        let e = emitter(Arc::new(MemoryLedger::new()), 0);
        let env = e.build_envelope(&request("http://peer"), "tx-1", datetime!(2024-01-01 10:15:00 UTC));

        assert_eq!(env["context"]["domain"], "energy.metering");
        assert_eq!(env["context"]["action"], "metering");
        assert_eq!(env["context"]["bpp_id"], "agent.test");
        assert_eq!(env["context"]["transaction_id"], "tx-1");
        assert_eq!(env["context"]["timestamp"], "2024-01-01T10:15:00.000000Z");
        assert_eq!(env["message"]["metering"]["timestamp"], env["context"]["timestamp"]);
        assert_eq!(env["message"]["metering"]["meter_id"], "M1");
        assert_eq!(env["message"]["metering"]["obp_id"], "obp-42");
        assert_eq!(env["message"]["metering"]["value_kwh"], 1.25);
    }

    #[tokio::test]
    async fn unreachable_target_is_reported_and_still_recorded() {
        let store = Arc::new(MemoryLedger::new());
        let e = emitter(store.clone(), 0);

        let report = e.send(request(&closed_port_url())).await.unwrap();
        assert_eq!(report.outcome.status_code, 502);
        assert!(report.outcome.resp_text.starts_with("delivery failed"));

        let rows = store
            .query_range(datetime!(1970-01-01 00:00:00 UTC), datetime!(9999-12-31 23:59:59 UTC))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, report.record_id);
        assert_eq!(rows[0].source, RecordSource::Sent);
        assert_eq!(rows[0].trust, Trust::Local);
        assert_eq!(rows[0].obp_id.as_deref(), Some("obp-42"));
        assert!(Signer::new("test-secret").unwrap().verify(&rows[0].raw_payload, &rows[0].signature));
    }

    /// Peer that always answers `status` and counts how often it was hit.
    async fn spawn_counting_peer(status: axum::http::StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/on_metering",
            axum::routing::post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, "peer says no")
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/on_metering"), hits)
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_the_limit_and_recorded_once() {
        let (url, hits) = spawn_counting_peer(axum::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let store = Arc::new(MemoryLedger::new());
        let e = emitter(store.clone(), 2);

        let report = e.send(request(&url)).await.unwrap();
        assert_eq!(report.outcome.status_code, 503);
        assert_eq!(report.outcome.resp_text, "peer says no");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let (url, hits) = spawn_counting_peer(axum::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let e = emitter(Arc::new(MemoryLedger::new()), 0);

        let report = e.send(request(&url)).await.unwrap();
        assert_eq!(report.outcome.status_code, 503);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = spawn_counting_peer(axum::http::StatusCode::BAD_REQUEST).await;
        let store = Arc::new(MemoryLedger::new());
        let e = emitter(store.clone(), 2);

        let report = e.send(request(&url)).await.unwrap();
        assert_eq!(report.outcome.status_code, 400);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_target_url_has_no_side_effects() {
        let store = Arc::new(MemoryLedger::new());
        let e = emitter(store.clone(), 0);

        for bad in ["not a url", "ftp://peer/on_metering"] {
            let err = e.send(request(bad)).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(ValidationError::TargetUrl(_))));
        }
        assert!(store.is_empty().await);
    }
}
