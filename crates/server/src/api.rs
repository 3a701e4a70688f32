// HTTP API for the collector.
//
// Response convention: every JSON body carries `success`; errors are
// `{"success": false, "error": "..."}`. Handlers fail fast into an
// error body and never abort the process.

use crate::blocklist::{BlockError, BlockManager, BlockScope, FirewallAdapter};
use crate::db::Database;
use crate::detection;
use crate::feed::{FeedEvent, FeedHub};
use crate::settings::Settings;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use secmon_core::{is_ignored_source, is_valid_ip, EventBatch};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// Application state
// ============================================================================

pub struct AppState {
    pub db: Arc<Database>,
    pub settings: Settings,
    /// Shared with the background expiry reconciler.
    pub blocks: Arc<BlockManager>,
    pub feed: FeedHub,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        db: Arc<Database>,
        settings: Settings,
        firewall: Arc<dyn FirewallAdapter>,
    ) -> SharedState {
        Arc::new(Self {
            blocks: Arc::new(BlockManager::new(db.clone(), firewall)),
            db,
            settings,
            feed: FeedHub::new(),
            start_time: chrono::Utc::now(),
        })
    }
}

/// Build the full application router under `base_path` (`/api/v1` by
/// default in production).
pub fn router(state: SharedState, base_path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_events))
        .route("/suspicious-ips", get(get_suspicious_ips))
        .route("/statistics", get(get_statistics))
        .route("/statistics/global", get(get_global_statistics))
        .route("/blocked-ips", get(get_blocked_ips))
        .route("/block", post(block_ip))
        .route("/block/per-vm", post(block_ip_per_host))
        .route("/block/:ip", delete(unblock_ip))
        .route("/feed", get(feed_stream))
        .route("/geo-attacks", get(get_geo_attacks))
        .route("/vms", get(list_hosts).post(register_host))
        .route("/vms/:id", delete(deregister_host))
        .route("/vms/:id/attacks", get(get_host_attacks));

    Router::new().nest(base_path, api).layer(cors).with_state(state)
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SuspiciousParams {
    threshold: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ManualBlockRequest {
    ip_address: String,
    reason: String,
    #[serde(default = "default_block_minutes")]
    duration_minutes: i64,
}

#[derive(Debug, Deserialize)]
struct PerHostBlockRequest {
    ip_address: String,
    vm_id: String,
    reason: String,
    #[serde(default = "default_block_minutes")]
    duration_minutes: i64,
}

fn default_block_minutes() -> i64 {
    120
}

#[derive(Debug, Deserialize)]
struct RegisterVmRequest {
    vm_id: String,
    hostname: String,
    ip_address: String,
    #[serde(default = "default_collection_method")]
    collection_method: String,
}

fn default_collection_method() -> String {
    "agent".to_string()
}

// ============================================================================
// Response helpers
// ============================================================================

type ApiResult = (StatusCode, Json<Value>);

fn ok(value: Value) -> ApiResult {
    (StatusCode::OK, Json(value))
}

fn err(status: StatusCode, msg: &str) -> ApiResult {
    (status, Json(json!({ "success": false, "error": msg })))
}

fn db_err(e: rusqlite::Error) -> ApiResult {
    err(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("database error: {}", e),
    )
}

// ============================================================================
// Ingestion
// ============================================================================

async fn ingest_events(
    State(state): State<SharedState>,
    Json(batch): Json<EventBatch>,
) -> ApiResult {
    if batch.host_id.trim().is_empty() {
        return err(StatusCode::BAD_REQUEST, "host_id must not be empty");
    }

    let mut accepted = 0usize;
    let mut admitted: Vec<FeedEvent> = Vec::new();

    for ev in &batch.events {
        // Loopback and unparseable source addresses never persist; a
        // bad event is dropped without failing the batch.
        if is_ignored_source(&ev.ip_address) || !is_valid_ip(&ev.ip_address) {
            tracing::debug!(ip = %ev.ip_address, "dropping event with unusable source address");
            continue;
        }

        match state.db.ingest_event(&batch.host_id, &batch.host_name, ev) {
            Ok(Some(attempt_number)) => {
                accepted += 1;
                admitted.push(FeedEvent {
                    source_ip: ev.ip_address.clone(),
                    target_username: ev.username.clone(),
                    event_timestamp: ev.timestamp.clone(),
                    host_id: batch.host_id.clone(),
                    attempt_number,
                });
            }
            Ok(None) => {} // duplicate: success, no write
            Err(e) => return db_err(e),
        }
    }

    // Detection and feed publication run on a detached task: they
    // complete even if the agent drops the connection after commit.
    let st = state.clone();
    let task = tokio::spawn(async move {
        for fe in admitted {
            let ip = fe.source_ip.clone();
            let host_id = fe.host_id.clone();
            st.feed.publish(fe);

            match detection::evaluate(&st.db, &st.settings, &ip, &host_id) {
                Ok(Some(decision)) => {
                    if let Err(e) = st.blocks.create_block(
                        &decision.ip,
                        decision.scope,
                        decision.target_host_id.as_deref(),
                        &decision.reason,
                        decision.duration_minutes,
                        "auto",
                    ) {
                        tracing::error!(ip = %ip, "auto-block failed: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(ip = %ip, "detection failed: {}", e),
            }
        }
    });
    let _ = task.await;

    ok(json!({ "success": true, "accepted": accepted }))
}

// ============================================================================
// Queries
// ============================================================================

async fn get_suspicious_ips(
    State(state): State<SharedState>,
    Query(params): Query<SuspiciousParams>,
) -> ApiResult {
    let threshold = params.threshold.unwrap_or(5);
    match state.db.suspicious_ips(threshold) {
        Ok(rows) => {
            let count = rows.len();
            ok(json!({ "success": true, "data": rows, "count": count }))
        }
        Err(e) => db_err(e),
    }
}

async fn get_statistics(State(state): State<SharedState>) -> ApiResult {
    match state.db.statistics() {
        Ok(stats) => ok(json!({ "success": true, "data": stats })),
        Err(e) => db_err(e),
    }
}

async fn get_global_statistics(State(state): State<SharedState>) -> ApiResult {
    match state.db.global_statistics() {
        Ok(stats) => ok(json!({ "success": true, "data": stats })),
        Err(e) => db_err(e),
    }
}

async fn get_blocked_ips(State(state): State<SharedState>) -> ApiResult {
    match state.db.active_blocks() {
        Ok(blocks) => {
            let data: Vec<Value> = blocks
                .iter()
                .map(|b| {
                    json!({
                        "ip_address": b.source_ip,
                        "blocked_at": b.created_at,
                        "block_expires": b.expires_at,
                        "reason": b.reason,
                        "auto_blocked": b.created_by == "auto",
                        "scope": b.scope,
                        "target_host_id": b.target_host_id,
                    })
                })
                .collect();
            let count = data.len();
            ok(json!({ "success": true, "data": data, "count": count }))
        }
        Err(e) => db_err(e),
    }
}

async fn get_geo_attacks() -> ApiResult {
    // Geolocation enrichment is not integrated; the dashboard expects
    // the endpoint to exist and return an empty set.
    ok(json!({ "success": true, "data": [] }))
}

// ============================================================================
// Blocks
// ============================================================================

async fn block_ip(
    State(state): State<SharedState>,
    Json(req): Json<ManualBlockRequest>,
) -> ApiResult {
    if !is_valid_ip(&req.ip_address) {
        return err(StatusCode::BAD_REQUEST, "invalid IP address");
    }

    match state.blocks.create_block(
        &req.ip_address,
        BlockScope::Global,
        None,
        &req.reason,
        req.duration_minutes,
        "manual",
    ) {
        Ok(_) => ok(json!({
            "success": true,
            "message": format!("IP {} blocked for {} minutes", req.ip_address, req.duration_minutes),
        })),
        Err(BlockError::NotFound) => err(StatusCode::NOT_FOUND, "no active block"),
        Err(BlockError::Db(e)) => db_err(e),
    }
}

async fn block_ip_per_host(
    State(state): State<SharedState>,
    Json(req): Json<PerHostBlockRequest>,
) -> ApiResult {
    if !is_valid_ip(&req.ip_address) {
        return err(StatusCode::BAD_REQUEST, "invalid IP address");
    }

    match state.blocks.create_block(
        &req.ip_address,
        BlockScope::PerHost,
        Some(&req.vm_id),
        &req.reason,
        req.duration_minutes,
        "manual",
    ) {
        Ok(_) => ok(json!({
            "success": true,
            "message": format!(
                "IP {} blocked on host {} for {} minutes",
                req.ip_address, req.vm_id, req.duration_minutes
            ),
        })),
        Err(BlockError::NotFound) => err(StatusCode::NOT_FOUND, "no active block"),
        Err(BlockError::Db(e)) => db_err(e),
    }
}

async fn unblock_ip(State(state): State<SharedState>, Path(ip): Path<String>) -> ApiResult {
    if !is_valid_ip(&ip) {
        return err(StatusCode::BAD_REQUEST, "invalid IP address");
    }

    match state.blocks.unblock(&ip, "manual") {
        Ok(_) => ok(json!({
            "success": true,
            "message": format!("IP {} unblocked", ip),
        })),
        Err(BlockError::NotFound) => {
            err(StatusCode::NOT_FOUND, &format!("no active block for {}", ip))
        }
        Err(BlockError::Db(e)) => db_err(e),
    }
}

// ============================================================================
// Hosts
// ============================================================================

async fn register_host(
    State(state): State<SharedState>,
    Json(req): Json<RegisterVmRequest>,
) -> ApiResult {
    if !is_valid_ip(&req.ip_address) {
        return err(StatusCode::BAD_REQUEST, "invalid IP address");
    }
    if req.vm_id.trim().is_empty() {
        return err(StatusCode::BAD_REQUEST, "vm_id must not be empty");
    }

    match state.db.register_host(
        &req.vm_id,
        &req.hostname,
        &req.ip_address,
        &req.collection_method,
    ) {
        Ok(()) => ok(json!({
            "success": true,
            "message": format!("host {} registered", req.vm_id),
        })),
        Err(e) => db_err(e),
    }
}

async fn list_hosts(State(state): State<SharedState>) -> ApiResult {
    match state.db.list_hosts() {
        Ok(hosts) => {
            let count = hosts.len();
            ok(json!({ "success": true, "data": hosts, "count": count }))
        }
        Err(e) => db_err(e),
    }
}

async fn deregister_host(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    match state.db.deactivate_host(&id) {
        Ok(true) => ok(json!({
            "success": true,
            "message": format!("host {} deregistered", id),
        })),
        Ok(false) => err(StatusCode::NOT_FOUND, &format!("unknown host {}", id)),
        Err(e) => db_err(e),
    }
}

async fn get_host_attacks(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    match state.db.host_attacks(&id) {
        Ok(summary) => {
            let mut value = serde_json::to_value(summary).unwrap_or_else(|_| json!({}));
            if let Some(obj) = value.as_object_mut() {
                obj.insert("success".to_string(), json!(true));
            }
            ok(value)
        }
        Err(e) => db_err(e),
    }
}

// ============================================================================
// Live feed
// ============================================================================

async fn feed_stream(
    State(state): State<SharedState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.feed.subscribe();

    let stream = BroadcastStream::new(rx).map_while(|msg| match msg {
        Ok(event) => {
            let frame = Event::default()
                .event("new_attack")
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().event("new_attack"));
            Some(Ok::<_, Infallible>(frame))
        }
        // This subscriber fell more than the buffer behind: close its
        // stream rather than block the others.
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "dropping lagged feed subscriber");
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive"),
    )
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let db_connected = state.db.ping();
    let active_hosts = state.db.count_hosts_with_status("active").unwrap_or(0);
    let uptime_seconds = (chrono::Utc::now() - state.start_time).num_seconds();

    Json(json!({
        "success": true,
        "status": if db_connected { "healthy" } else { "unhealthy" },
        "uptime_seconds": uptime_seconds,
        "active_hosts": active_hosts,
        "db_connected": db_connected,
    }))
}
