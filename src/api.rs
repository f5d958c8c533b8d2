use std::{
    collections::BTreeMap,
    sync::Arc,
};

use axum::{
    Json,
    Router,
    extract::{
        Path,
        Query,
        State,
        rejection::{
            JsonRejection,
            QueryRejection,
        },
    },
    http::{HeaderValue, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{
    DateTime,
    SecondsFormat,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    analytics::{
        AdmissionEvent,
        EndpointUsage,
        UsageQuery,
    },
    engine::Engine,
    error::{
        ApiError,
        ApiResult,
    },
    middleware::logging::request_context,
    ratelimit::{
        Remaining,
        tiered::Tier,
    },
};

const DEFAULT_ENDPOINT: &str = "default";

pub fn routes(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/check", post(check))
        .route("/status/{subject_id}", get(status))
        .route("/quota/check", post(quota_check))
        .route("/quota/reset", post(quota_reset))
        .route("/analytics/usage", get(analytics_usage))
        .route("/health", get(health))
        .layer(middleware::from_fn(request_context))
        .with_state(engine)
}

fn rfc3339(ms: u64) -> String {
    DateTime::from_timestamp_millis(ms as i64)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn parse_timestamp(field: &str, raw: Option<&str>) -> ApiResult<Option<u64>> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(raw)
            .map(|at| at.timestamp_millis().max(0) as u64)
            .map_err(|err| ApiError::InvalidRequest(format!("invalid {field}: {err}")))
    })
    .transpose()
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn rate(limit: Option<u64>) -> Remaining {
    limit.map_or(Remaining::Unlimited, Remaining::Limited)
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    subject_id: String,
    endpoint: String,
    tier: String,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    allowed: bool,
    remaining: Remaining,
    reset_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    tier: Tier,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    degraded: bool,
}

async fn check(
    State(engine): State<Arc<Engine>>,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    require("subject_id", &request.subject_id)?;
    require("endpoint", &request.endpoint)?;

    let tier = Tier::resolve(&request.tier);
    let verdict = engine
        .limiter
        .check(&request.subject_id, &request.endpoint, tier)
        .await;

    // A degraded verdict means the store is already past its deadline.
    if !verdict.degraded {
        engine
            .analytics
            .record(AdmissionEvent {
                subject_id: &request.subject_id,
                endpoint: &request.endpoint,
                tier,
                allowed: verdict.allowed,
            })
            .await;
    }

    if !verdict.allowed {
        tracing::info!(
            subject_id = %request.subject_id,
            endpoint = %request.endpoint,
            tier = %tier,
            ip_address = ?request.ip_address,
            user_agent = ?request.user_agent,
            "request blocked"
        );
    }

    let retry_after = verdict.retry_after_secs();
    let mut response = Json(CheckResponse {
        allowed: verdict.allowed,
        remaining: verdict.remaining,
        reset_time: rfc3339(verdict.reset_at_ms),
        retry_after,
        tier,
        degraded: verdict.degraded,
    })
    .into_response();

    if let Some(secs) = retry_after.filter(|_| !verdict.allowed) {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }

    Ok(response)
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    tier: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct LimitsBody {
    requests_per_hour: Remaining,
    requests_per_minute: Remaining,
    burst_capacity: u64,
}

#[derive(Debug, Serialize)]
struct UsageBody {
    hourly: Option<u64>,
    per_minute: Option<u64>,
    burst_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ResetsBody {
    hourly: Option<String>,
    per_minute: Option<String>,
    burst: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    subject_id: String,
    endpoint: String,
    tier: Tier,
    limits: LimitsBody,
    current_usage: UsageBody,
    reset_times: ResetsBody,
}

async fn status(
    State(engine): State<Arc<Engine>>,
    Path(subject_id): Path<String>,
    params: Result<Query<StatusParams>, QueryRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Query(params) = params?;
    let tier = params.tier.as_deref().map_or(Tier::Free, Tier::resolve);
    let endpoint = params
        .endpoint
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let status = engine.limiter.status(&subject_id, &endpoint, tier).await?;

    Ok(Json(StatusResponse {
        subject_id,
        endpoint,
        tier: status.tier,
        limits: LimitsBody {
            requests_per_hour: rate(status.limits.requests_per_hour),
            requests_per_minute: rate(status.limits.requests_per_minute),
            burst_capacity: status.limits.burst_capacity,
        },
        current_usage: UsageBody {
            hourly: status.hourly.map(|w| w.used),
            per_minute: status.per_minute.map(|w| w.used),
            burst_tokens: status.burst_tokens,
        },
        reset_times: ResetsBody {
            hourly: status.hourly.map(|w| rfc3339(w.reset_at_ms)),
            per_minute: status.per_minute.map(|w| rfc3339(w.reset_at_ms)),
            burst: status.burst_full_at_ms.map(rfc3339),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct QuotaCheckRequest {
    subject_id: String,
    resource: String,
    amount: u64,
}

#[derive(Debug, Serialize)]
struct QuotaCheckResponse {
    allowed: bool,
    remaining: u64,
    total: u64,
    reset_date: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    degraded: bool,
}

async fn quota_check(
    State(engine): State<Arc<Engine>>,
    payload: Result<Json<QuotaCheckRequest>, JsonRejection>,
) -> ApiResult<Json<QuotaCheckResponse>> {
    let Json(request) = payload?;
    require("subject_id", &request.subject_id)?;

    let verdict = engine
        .quota
        .check_and_consume(&request.subject_id, &request.resource, request.amount)
        .await?;

    Ok(Json(QuotaCheckResponse {
        allowed: verdict.allowed,
        remaining: verdict.remaining,
        total: verdict.total,
        reset_date: rfc3339(verdict.reset_at_ms),
        degraded: verdict.degraded,
    }))
}

#[derive(Debug, Deserialize)]
struct QuotaResetParams {
    subject_id: String,
    resource: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

async fn quota_reset(
    State(engine): State<Arc<Engine>>,
    params: Result<Query<QuotaResetParams>, QueryRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Query(params) = params?;
    require("subject_id", &params.subject_id)?;

    engine
        .quota
        .reset(&params.subject_id, params.resource.as_deref())
        .await?;

    let message = match params.resource {
        Some(resource) => format!("Quota for {resource} reset for {}", params.subject_id),
        None => format!("All quotas reset for {}", params.subject_id),
    };
    Ok(Json(MessageResponse { message }))
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    subject_id: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct TimeRange {
    start: String,
    end: String,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    subject_id: Option<String>,
    time_range: TimeRange,
    total_requests: u64,
    blocked_requests: u64,
    top_endpoints: Vec<EndpointUsage>,
    tier_distribution: BTreeMap<String, u64>,
}

async fn analytics_usage(
    State(engine): State<Arc<Engine>>,
    params: Result<Query<UsageParams>, QueryRejection>,
) -> ApiResult<Json<UsageResponse>> {
    let Query(params) = params?;
    let query = UsageQuery {
        subject_id: params.subject_id.filter(|s| !s.trim().is_empty()),
        start_ms: parse_timestamp("start_time", params.start_time.as_deref())?,
        end_ms: parse_timestamp("end_time", params.end_time.as_deref())?,
    };

    let report = engine.analytics.usage(&query).await?;

    Ok(Json(UsageResponse {
        subject_id: query.subject_id,
        time_range: TimeRange {
            start: rfc3339(report.start_ms),
            end: rfc3339(report.end_ms),
        },
        total_requests: report.total_requests,
        blocked_requests: report.blocked_requests,
        top_endpoints: report.top_endpoints,
        tier_distribution: report.tier_distribution,
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend_status: &'static str,
    backend: &'static str,
}

async fn health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    let (status, backend_status) = match engine.store.ping().await {
        Ok(()) => ("ok", "connected"),
        Err(err) => {
            tracing::warn!(backend = engine.store.name(), error = %err, "counter store health check failed");
            ("degraded", "unavailable")
        }
    };

    Json(HealthResponse {
        status,
        backend_status,
        backend: engine.store.name(),
    })
}
