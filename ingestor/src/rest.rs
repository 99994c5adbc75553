use crate::errors::Error;
use crate::export::{export_filename, readings_to_csv};
use crate::ingest::IngestService;
use crate::metrics::{
    ACCEPTED_READINGS_TOTAL, BOOT_NOTIFICATIONS_TOTAL, REJECTED_READINGS_TOTAL,
    STORAGE_FAILURES_TOTAL, SUBMISSIONS_TOTAL, SUBMIT_LATENCY_SECONDS,
};
use crate::model::{ReadingFilter, ReadingsResponse, SubmitOutcome};
use crate::rate_limit::{rate_limit, RateLimiter};
use crate::validate::source;
use axum::{
    extract::{rejection::QueryRejection, Form, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

const SERVER_NAME: &str = "Smart Energy Meter Data Receiver";
const SAMPLE_METER_URL: &str = "/meter?v=230.5&c=8.750&pf=0.92&l=2.01560&k=1250.75&f=50.2\
     &d=26-07-2025%2013:05:30&r=0&s=atmega328pb";
const ENDPOINTS: [&str; 7] = [
    "/meter",
    "/api/data",
    "/api/export",
    "/api/stats",
    "/health",
    "/test",
    "/metrics",
];

#[derive(Clone)]
struct AppState {
    ingest: IngestService,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    start_date: NaiveDate,
    end_date: NaiveDate,
    source: Option<String>,
}

pub fn create_router(ingest: IngestService, limiter: Arc<RateLimiter>) -> Router {
    let state = AppState {
        ingest,
        started_at: Utc::now(),
    };

    Router::new()
        .route(
            "/meter",
            get(submit_query)
                .post(submit_form)
                .route_layer(middleware::from_fn_with_state(limiter, rate_limit)),
        )
        .route("/api/data", get(get_data))
        .route("/api/export", get(export_data))
        .route("/api/stats", get(get_stats))
        .route("/health", get(health))
        .route("/test", get(test_endpoint))
        .fallback(not_found)
        .with_state(state)
}

/// CORS policy for the configured origins; `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn submit_query(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    submit(&state, params).await
}

async fn submit_form(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    submit(&state, params).await
}

async fn submit(state: &AppState, params: HashMap<String, String>) -> Response {
    SUBMISSIONS_TOTAL.inc();
    debug!("Raw params: {:?}", params);

    let timer = SUBMIT_LATENCY_SECONDS.start_timer();
    let result = state.ingest.submit_reading(&params).await;
    timer.observe_duration();

    let device = source(&params);

    match result {
        Ok(SubmitOutcome::BootAcknowledged) => {
            BOOT_NOTIFICATIONS_TOTAL.inc();
            info!(
                "Boot notification from device {} (device time: {}, previous failures: {})",
                device,
                params.get("d").map(String::as_str).unwrap_or("-"),
                params.get("r").map(String::as_str).unwrap_or("0"),
            );
            Json(json!({
                "status": "BOOT_ACK",
                "message": "Boot notification received"
            }))
            .into_response()
        }
        Ok(SubmitOutcome::Accepted(inserted)) => {
            ACCEPTED_READINGS_TOTAL.inc();
            info!("Stored reading {} from {:?}", inserted.id, device);
            Json(json!({
                "status": "OK",
                "message": "Data received and stored",
                "reading_id": inserted.id,
                "timestamp": inserted.received_at
            }))
            .into_response()
        }
        Err(Error::Validation(e)) => {
            REJECTED_READINGS_TOTAL.inc();
            warn!("Rejected submission from {:?}: {}", device, e);
            if !device.is_empty() {
                if let Err(report_err) = state.ingest.report_device_error(device).await {
                    error!("Failed to record error for {}: {}", device, report_err);
                }
            }
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": e.to_string(),
                    "fields": e.fields()
                })),
            )
                .into_response()
        }
        Err(e) => {
            STORAGE_FAILURES_TOTAL.inc();
            error!("Failed to store reading from {:?}: {}", device, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to store reading",
                    "message": "Please check the server logs for more details"
                })),
            )
                .into_response()
        }
    }
}

async fn get_data(
    State(state): State<AppState>,
    query: Result<Query<ReadingFilter>, QueryRejection>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let Query(filter) = query.map_err(AppError::bad_query)?;
    let readings = state.ingest.store().query_readings(&filter).await?;

    Ok(Json(ReadingsResponse {
        status: "success",
        count: readings.len(),
        data: readings,
    }))
}

async fn export_data(
    State(state): State<AppState>,
    query: Result<Query<ExportQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = query.map_err(AppError::bad_query)?;
    let readings = state
        .ingest
        .store()
        .query_readings_by_range(params.start_date, params.end_date, params.source.as_deref())
        .await?;
    let body = readings_to_csv(&readings)?;

    info!(
        "Exported {} readings for {}..{}",
        readings.len(),
        params.start_date,
        params.end_date
    );

    let disposition = format!("attachment; filename=\"{}\"", export_filename(Utc::now()));
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let statistics = state.ingest.store().get_statistics().await?;

    Ok(Json(json!({
        "status": "success",
        "statistics": statistics,
        "server_time": Utc::now()
    })))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database_ok = state.ingest.store().health_check().await;
    if !database_ok {
        warn!("Database health check failed");
    }

    let now = Utc::now();
    Json(json!({
        "status": if database_ok { "healthy" } else { "degraded" },
        "timestamp": now,
        "server": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (now - state.started_at).num_seconds(),
        "database": if database_ok { "connected" } else { "error" },
        "endpoints": ENDPOINTS
    }))
}

async fn test_endpoint() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Smart Energy Meter Server is running",
        "timestamp": Utc::now(),
        "sample_urls": {
            "GET": SAMPLE_METER_URL,
            "POST": "/meter (with form data)"
        },
        "api_endpoints": {
            "data": "/api/data?source=atmega328pb&limit=100",
            "export": "/api/export?start_date=2025-07-01&end_date=2025-07-31",
            "stats": "/api/stats"
        }
    }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "message": "Use GET /meter with query parameters or POST /meter with form data",
            "available_endpoints": ENDPOINTS,
            "example": SAMPLE_METER_URL
        })),
    )
        .into_response()
}

enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl AppError {
    fn bad_query(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => {
                debug!("Bad request: {}", message);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid query parameters",
                        "message": message
                    })),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!("API error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Internal server error",
                        "message": "Please check the server logs for more details"
                    })),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn app() -> (Router, IngestService) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let ingest = IngestService::new(store);
        let router = create_router(ingest.clone(), Arc::new(RateLimiter::disabled()));
        (router, ingest)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_get_meter_stores_reading() {
        let (router, ingest) = app().await;
        let (status, body) = get_json(router, SAMPLE_METER_URL).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert!(body["reading_id"].as_i64().is_some());

        let latest = ingest.store().latest_reading(None).await.unwrap().unwrap();
        assert_eq!(latest.source, "atmega328pb");
        assert_eq!(latest.device_timestamp.as_deref(), Some("26-07-2025 13:05:30"));
    }

    #[tokio::test]
    async fn test_post_form_stores_reading() {
        let (router, ingest) = app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/meter")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("v=231&c=2.5&k=10&s=meter-2"))
            .unwrap();

        let (status, _) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);

        let latest = ingest.store().latest_reading(Some("meter-2")).await.unwrap().unwrap();
        assert_eq!(latest.voltage, Some(231.0));
    }

    #[tokio::test]
    async fn test_boot_ack() {
        let (router, ingest) = app().await;
        let (status, body) = get_json(router, "/meter?s=meter-1_boot&d=boot-time").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "BOOT_ACK");

        let status = ingest.store().device_status("meter-1_boot").await.unwrap().unwrap();
        assert_eq!(status.boot_count, 1);
    }

    #[tokio::test]
    async fn test_missing_fields_bad_request() {
        let (router, _) = app().await;
        let (status, body) = get_json(router, "/meter?pf=0.9").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["fields"], json!(["v", "c", "k"]));
        assert!(body["error"].as_str().unwrap().contains("Missing required fields"));
    }

    #[tokio::test]
    async fn test_rejection_counts_device_error() {
        let (router, ingest) = app().await;
        let (status, body) = get_json(router, "/meter?v=230&c=1&k=1&f=70&s=meter-3").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["fields"], json!(["f"]));

        let status = ingest.store().device_status("meter-3").await.unwrap().unwrap();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.status, "error");
        assert!(ingest.store().latest_reading(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_is_generic() {
        let (router, ingest) = app().await;
        ingest.store().close().await;

        let (status, body) = get_json(router, "/meter?v=230&c=1&k=1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to store reading");
    }

    #[tokio::test]
    async fn test_data_endpoint_filters() {
        let (router, _) = app().await;
        for uri in [
            "/meter?v=230&c=1&k=1&s=a",
            "/meter?v=230&c=1&k=2&s=b",
            "/meter?v=230&c=1&k=3&s=a",
        ] {
            let (status, _) = get_json(router.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = get_json(router.clone(), "/api/data?source=a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["data"][0]["kwh"], 3.0);

        let (_, body) = get_json(router.clone(), "/api/data?source=All&limit=1").await;
        assert_eq!(body["count"], 1);

        let request = Request::builder()
            .uri("/api/data?start_date=yesterday")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Invalid query parameters");
    }

    #[tokio::test]
    async fn test_data_endpoint_ignores_empty_and_bad_filters() {
        let (router, _) = app().await;
        get_json(router.clone(), "/meter?v=230&c=1&k=1&s=a").await;

        let (status, body) =
            get_json(router.clone(), "/api/data?source=&start_date=&end_date=").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = get_json(router, "/api/data?limit=lots").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_export_csv() {
        let (router, _) = app().await;
        get_json(router.clone(), "/meter?v=230&c=1&k=1&s=a").await;

        let today = Utc::now().date_naive();
        let uri = format!("/api/export?start_date={}&end_date={}", today, today);
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("meter_data_"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let csv = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.starts_with("id,voltage,current"));
    }

    #[tokio::test]
    async fn test_export_requires_dates() {
        let (router, _) = app().await;
        let request = Request::builder()
            .uri("/api/export?start_date=&end_date=2025-07-31")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Invalid query parameters");

        let (status, body) = get_json(router, "/api/export").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("start_date"));
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (router, ingest) = app().await;
        get_json(router.clone(), "/meter?v=230&c=1&k=1&s=a").await;

        let (status, body) = get_json(router.clone(), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statistics"]["total_readings"], 1);
        assert_eq!(body["statistics"]["sources"]["a"], 1);

        let (_, body) = get_json(router.clone(), "/health").await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "connected");

        ingest.store().close().await;
        let (status, body) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let (router, _) = app().await;
        let (status, body) = get_json(router.clone(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Endpoint not found");

        let request = Request::builder()
            .method("DELETE")
            .uri("/meter")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_cors_layer_builds_for_lists() {
        let _any = cors_layer(&["*".to_string()]);
        let _list = cors_layer(&["http://a.example".to_string(), "bad\norigin".to_string()]);
    }
}
