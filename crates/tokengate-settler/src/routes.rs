use actix_web::{get, post, web, HttpRequest, HttpResponse};
use tokengate::{security, SettleError, SettlementOutcome};

use crate::metrics;
use crate::state::AppState;

/// Header carrying the processor's `t=...,v1=...` signature.
const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

fn outcome_label(outcome: &SettlementOutcome) -> &'static str {
    match outcome {
        SettlementOutcome::Settled { .. } => "settled",
        SettlementOutcome::AwaitingClaim { .. } => "awaiting_claim",
        SettlementOutcome::Monitoring { .. } => "monitoring",
        SettlementOutcome::Rejected { .. } => "rejected",
        SettlementOutcome::Duplicate => "duplicate",
        SettlementOutcome::Ignored => "ignored",
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.dispatcher.health_check().await {
        Ok(block) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "tokengate-settler",
            "network": state.dispatcher.config().network,
            "latestBlock": block.to_string(),
        })),
        Err(_) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "degraded",
            "service": "tokengate-settler",
            "error": "RPC unreachable",
        })),
    }
}

#[post("/webhook")]
pub async fn webhook(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let header = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = match state.gateway.accept(&body, header) {
        Ok(event) => event,
        Err(SettleError::Authentication(msg)) => {
            let reason = if header.is_none() { "missing" } else { "invalid" };
            metrics::SIGNATURE_FAILURES
                .with_label_values(&[reason])
                .inc();
            tracing::warn!(reason, %msg, "webhook signature rejected");
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication failed"
            }));
        }
        Err(e) => {
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&["rejected"])
                .inc();
            tracing::warn!(error = %e, "webhook payload rejected");
            return HttpResponse::BadRequest().json(serde_json::json!({
                "received": false,
                "error": "invalid webhook payload",
            }));
        }
    };

    let start = std::time::Instant::now();
    match state.dispatcher.process_event(&event).await {
        Ok(outcome) => {
            let label = outcome_label(&outcome);
            let elapsed = start.elapsed().as_secs_f64();
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&["accepted"])
                .inc();
            metrics::SETTLEMENTS.with_label_values(&[label]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&[label])
                .observe(elapsed);

            let response = match &outcome {
                SettlementOutcome::Settled {
                    payment_reference,
                    tx_id,
                }
                | SettlementOutcome::AwaitingClaim {
                    payment_reference,
                    tx_id,
                } => serde_json::json!({
                    "received": true,
                    "outcome": label,
                    "paymentReference": payment_reference,
                    "transaction": tx_id,
                }),
                SettlementOutcome::Monitoring {
                    payment_reference,
                    tx_id,
                } => serde_json::json!({
                    "received": true,
                    "outcome": label,
                    "paymentReference": payment_reference,
                    "transaction": tx_id,
                }),
                SettlementOutcome::Rejected {
                    payment_reference,
                    reason,
                } => serde_json::json!({
                    "received": true,
                    "outcome": label,
                    "paymentReference": payment_reference,
                    "reason": reason,
                }),
                SettlementOutcome::Duplicate | SettlementOutcome::Ignored => serde_json::json!({
                    "received": true,
                    "outcome": label,
                }),
            };
            HttpResponse::Ok().json(response)
        }
        Err(e) => {
            let elapsed = start.elapsed().as_secs_f64();
            metrics::WEBHOOK_REQUESTS.with_label_values(&["error"]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["error"])
                .observe(elapsed);

            // Retryable failures get a 5xx so the processor re-delivers;
            // the idempotency ledger makes the retry safe. Everything else
            // is terminal for this event.
            if e.is_retryable() {
                tracing::error!(event = %event.event_id, error = %e, "settlement failed, requesting retry");
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "received": false,
                    "error": "settlement failed",
                }))
            } else {
                tracing::warn!(event = %event.event_id, error = %e, "webhook event rejected");
                HttpResponse::BadRequest().json(serde_json::json!({
                    "received": false,
                    "error": e.to_string(),
                }))
            }
        }
    }
}

#[get("/payments/{reference}")]
pub async fn payment_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let reference = path.into_inner();
    match state.dispatcher.db().get_payment_by_reference(&reference) {
        Ok(Some(payment)) => HttpResponse::Ok().json(payment),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "unknown payment reference"
        })),
        Err(e) => {
            tracing::error!(%reference, error = %e, "payment lookup failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "lookup failed"
            }))
        }
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| security::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);

            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            // No token configured — metrics stay protected unless the
            // operator explicitly opts in to public access.
            let public_metrics = std::env::var("TOKENGATE_PUBLIC_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            if !public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "forbidden",
                    "message": "Set METRICS_TOKEN or TOKENGATE_PUBLIC_METRICS=true to access /metrics"
                }));
            }
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
