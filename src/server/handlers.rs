//! HTTP endpoint handler functions.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use tracing::warn;

use crate::checks::{run_unit_authenticity_checks, UnitIdentity};
use crate::features::{user_risk_flag, RiskContext};
use crate::notify::{fan_out_scan_event, ScanEvent};
use crate::signature::{embedded_batch_id, verify_signature};
use crate::store::{ConsumerRecord, NewScan, ScanResult, ScanStore};

use super::logging::ScanLogEntry;
use super::types::*;
use super::ServerState;

/// Trailing window for regional and anonymous suspicious-scan ratios.
const RATIO_WINDOW_DAYS: i64 = 30;

/// Scan-type tag stored with every consumer QR prediction.
const SCAN_TYPE_CONSUMER_QR: &str = "consumer_qr";

fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

/// Lenient float parse for the `lat`/`long` query params: malformed input
/// is treated as absent, never a request error.
fn parse_coordinate(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Resolve the optional authenticated consumer from the `x-user-id` header
/// injected by the upstream identity gateway. A lookup failure degrades the
/// scan to anonymous, which raises the risk baseline, so it is logged rather
/// than silently swallowed.
fn resolve_consumer(store: &ScanStore, headers: &HeaderMap) -> Option<ConsumerRecord> {
    let user_id = headers.get("x-user-id")?.to_str().ok()?;
    match store.consumer_by_user_id(user_id) {
        Ok(found) => found,
        Err(e) => {
            warn!(user_id, error = %e, "consumer lookup failed; treating scan as anonymous");
            None
        }
    }
}

/// `GET /api/v1/verify/unit/{serial_number}?sig=...&lat=...&long=...`
///
/// The pipeline runs strictly in order: signature check → event-log fetch →
/// authenticity verdict → scan-history insert → notification fan-out → risk
/// features → inference → prediction insert → response. Errors before the
/// verdict abort the request; fan-out failures never do; inference failures
/// are escalated because the risk score is part of the response contract.
pub async fn verify_unit_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(serial_number): Path<String>,
    Query(query): Query<VerifyQuery>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    state.usage.ep_verify.fetch_add(1, Ordering::Relaxed);

    if let Some(limiter) =
        super::middleware::get_rate_limiter(&state.config, &state.rate_limiters, addr.ip()).await
    {
        if limiter.check().is_err() {
            state.usage.record_error();
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::new(format!(
                    "Rate limit exceeded. Maximum {} requests per minute.",
                    state.config.rate_limit_rpm
                )),
            );
        }
    }

    // 1. The request itself must carry a signature.
    let supplied_sig = match query.sig.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => {
            state.usage.record_error();
            return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Missing signature"));
        }
    };

    // 2. Resolve the unit with its batch and owning organization.
    let bundle = match state.store.unit_by_serial(&serial_number) {
        Ok(Some(b)) => b,
        Ok(None) => {
            state.usage.record_error();
            return error_response(StatusCode::NOT_FOUND, ErrorResponse::new("Unit not found"));
        }
        Err(e) => {
            state.usage.record_error();
            warn!(%serial_number, error = %e, "unit lookup failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Unit lookup failed"),
            );
        }
    };

    // 3. The serial number embeds its batch identity; a mismatch against the
    // stored batch means a substituted serial, regardless of whether the
    // signature itself verifies for some other unit.
    let decoded_batch = embedded_batch_id(&serial_number);
    if decoded_batch.as_deref() != Some(bundle.batch.batch_id.as_str()) {
        state.usage.record_error();
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("This product URL is not legitimate"),
        );
    }

    // 4. Recompute the signature for the exact stored tuple. Catches both
    // tampered tokens and validly-signed tokens minted for another unit.
    if !verify_signature(
        supplied_sig,
        &bundle.unit.serial_number,
        &bundle.batch.batch_id,
        bundle.unit.registry_sequence,
        &state.config.qr_secret,
    ) {
        state.usage.record_error();
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("Signature verification failed"),
        );
    }

    // 5. Replay the batch's full event history from the registry.
    let events = match state
        .ledger
        .fetch_event_log(&bundle.batch.registry_topic_id)
        .await
    {
        Ok(entries) => entries,
        Err(e) => {
            state.usage.record_error();
            warn!(
                topic_id = %bundle.batch.registry_topic_id,
                error = %e,
                "event log fetch failed"
            );
            return error_response(
                StatusCode::BAD_GATEWAY,
                ErrorResponse::new("Registry event log unavailable"),
            );
        }
    };

    // 6. Authenticity verdict. NOT_SAFE forces valid=false even though the
    // signature checked out.
    let unit_id_str = bundle.unit.id.to_string();
    let org_id_str = bundle.organization.id.to_string();
    let verdict = run_unit_authenticity_checks(
        &events,
        &UnitIdentity {
            unit_id: &unit_id_str,
            batch_id: &bundle.batch.batch_id,
            organization_id: &org_id_str,
            topic_id: &bundle.batch.registry_topic_id,
        },
    );
    let valid = !verdict.is_not_safe();
    let scan_result = if verdict.is_not_safe() {
        ScanResult::Suspicious
    } else {
        ScanResult::Genuine
    };

    // 7. Optional authenticated user, injected by the upstream identity
    // gateway; a consumer row may or may not exist for it.
    let consumer = resolve_consumer(&state.store, &headers);

    let latitude = parse_coordinate(query.lat.as_deref());
    let longitude = parse_coordinate(query.long.as_deref());
    let region = bundle.organization.region.clone();
    let scanned_at = Utc::now();

    // 8. Record the scan. Its id is the join key for the prediction row and
    // the outbound notification payloads, so this happens before either.
    let scan_id = match state.store.insert_scan(&NewScan {
        unit_id: bundle.unit.id,
        consumer_id: consumer.as_ref().map(|c| c.id),
        is_anonymous: consumer.is_none(),
        region: region.clone(),
        scan_result,
        latitude,
        longitude,
        scanned_at,
    }) {
        Ok(id) => id,
        Err(e) => {
            state.usage.record_error();
            warn!(%serial_number, error = %e, "scan history insert failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Failed to record scan"),
            );
        }
    };

    // 9. Best-effort fan-out; cannot fail the request.
    let report = fan_out_scan_event(
        &state.notifier,
        &state.store,
        &bundle.organization,
        &ScanEvent {
            scan_id,
            serial_number: bundle.unit.serial_number.clone(),
            batch_id: bundle.batch.batch_id.clone(),
            scan_result: scan_result.as_str().to_string(),
            region: region.clone(),
            timestamp: scanned_at.to_rfc3339(),
        },
    )
    .await;
    state.usage.record_fan_out(&report);

    // 10. Risk features: historical ratios are recomputed per scan over the
    // trailing window; a failed ratio query degrades to 0, matching the
    // no-prior-scans case.
    let since = scanned_at - Duration::days(RATIO_WINDOW_DAYS);
    let incident_rate = state
        .store
        .regional_incident_rate(&region, since)
        .unwrap_or_else(|e| {
            warn!(%region, error = %e, "incident rate query failed");
            0.0
        });
    let suspicious_ratio = match consumer.as_ref() {
        Some(c) => state.store.consumer_suspicious_ratio(c.id),
        None => state.store.anonymous_suspicious_ratio(&region, since),
    }
    .unwrap_or_else(|e| {
        warn!(%region, error = %e, "suspicious ratio query failed");
        0.0
    });

    let context = RiskContext {
        region: region.clone(),
        latitude: latitude.unwrap_or(0.0) as f32,
        longitude: longitude.unwrap_or(0.0) as f32,
        scanned_at,
        regional_incident_rate: incident_rate as f32,
        user_risk_flag: user_risk_flag(consumer.is_some(), suspicious_ratio as f32),
    };

    // 11. Inference. Load/score failures are fatal: the risk score is part
    // of the advertised response contract. The scan row stays; the scan
    // did happen; only the risk annotation is missing.
    let prediction = match state.model().await {
        Ok(model) => match crate::score_risk(&model, &context) {
            Ok(p) => p,
            Err(e) => {
                state.usage.record_error();
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::inference("Risk scoring failed", e.to_string()),
                );
            }
        },
        Err(e) => {
            state.usage.record_error();
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::inference("Risk model unavailable", e.to_string()),
            );
        }
    };

    // 12. Persist the prediction. The scoring succeeded and the contract is
    // satisfied, so a failed audit insert is logged, not escalated.
    match state.store.insert_prediction(
        scan_id,
        prediction.label,
        f64::from(prediction.probability),
        &region,
        SCAN_TYPE_CONSUMER_QR,
    ) {
        Ok(_) => {
            state.usage.predictions_scored.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(scan_id, error = %e, "prediction insert failed");
        }
    }

    state.usage.record(
        scan_result,
        &ScanLogEntry {
            serial_number: &bundle.unit.serial_number,
            scan_result: scan_result.as_str(),
            valid,
            scan_id,
            processing_time_ms: start.elapsed().as_millis() as u64,
        },
    );

    (
        StatusCode::OK,
        Json(VerifyResponse {
            valid,
            unit: bundle.unit,
            batch: bundle.batch,
            authenticity_result_check: verdict,
            risk: RiskView {
                label: prediction.label,
                probability: prediction.probability,
            },
        }),
    )
        .into_response()
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> Response {
    state.usage.ep_health.fetch_add(1, Ordering::Relaxed);

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_hash: state.model_hash(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        db_ok: state.store.ping().is_ok(),
    };
    Json(response).into_response()
}

pub async fn stats_handler(State(state): State<Arc<ServerState>>) -> Response {
    state.usage.ep_stats.fetch_add(1, Ordering::Relaxed);

    let response = StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        requests: RequestStats {
            total: state.usage.total_requests.load(Ordering::Relaxed),
            errors: state.usage.total_errors.load(Ordering::Relaxed),
        },
        verdicts: VerdictStats {
            genuine: state.usage.genuine.load(Ordering::Relaxed),
            suspicious: state.usage.suspicious.load(Ordering::Relaxed),
        },
        endpoints: EndpointStats {
            verify: state.usage.ep_verify.load(Ordering::Relaxed),
            health: state.usage.ep_health.load(Ordering::Relaxed),
            stats: state.usage.ep_stats.load(Ordering::Relaxed),
        },
        predictions_scored: state.usage.predictions_scored.load(Ordering::Relaxed),
        notifications: NotificationStats {
            sent: state.usage.notifications_sent.load(Ordering::Relaxed),
            failed: state.usage.notifications_failed.load(Ordering::Relaxed),
        },
    };
    Json(response).into_response()
}
